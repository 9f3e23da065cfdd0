//! Authentication and document access control.
//!
//! Two separate questions are answered here:
//! - who is connecting: [`TokenVerifier`] checks a signed session token
//! - may they open this document, and with which [`Role`]: [`AccessControl`]
//!
//! The access check is an external collaborator. [`StaticAccessControl`] is
//! the configuration-backed implementation used by the binary and the tests.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;

use crate::config::WorkspaceConfig;
use crate::ids::{DocumentId, UserId};

const TOKEN_KEY_CONTEXT: &str = "collab-sync 2024 session token v1";

/// Workspace role of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Admin,
    Editor,
    Commenter,
    Viewer,
}

impl Role {
    /// Whether sessions with this role may send operations.
    pub fn can_edit(self) -> bool {
        matches!(self, Role::Admin | Role::Editor)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Role::Admin => "admin",
            Role::Editor => "editor",
            Role::Commenter => "commenter",
            Role::Viewer => "viewer",
        };
        f.write_str(name)
    }
}

/// Decides whether a user may open a document.
///
/// Called on every room subscribe; results are never cached across joins.
#[async_trait]
pub trait AccessControl: Send + Sync {
    /// Returns the user's role for the document, or `None` if access is denied.
    async fn authorize(&self, user: &UserId, document: &DocumentId) -> Option<Role>;
}

/// Access control backed by a fixed set of workspaces.
///
/// A user may open a document iff the document is bound to a workspace the
/// user is a member of. The user's role in that workspace applies.
#[derive(Debug, Default)]
pub struct StaticAccessControl {
    /// document → workspace
    documents: HashMap<DocumentId, String>,
    /// workspace → (user → role)
    members: HashMap<String, HashMap<UserId, Role>>,
}

impl StaticAccessControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_workspaces(workspaces: &[WorkspaceConfig]) -> Self {
        let mut access = Self::new();
        for workspace in workspaces {
            for member in &workspace.members {
                access.add_member(&workspace.id, member.user.clone(), member.role);
            }
            for document in &workspace.documents {
                access.bind_document(&workspace.id, document.clone());
            }
        }
        access
    }

    pub fn add_member(&mut self, workspace: &str, user: UserId, role: Role) {
        self.members
            .entry(workspace.to_string())
            .or_default()
            .insert(user, role);
    }

    pub fn bind_document(&mut self, workspace: &str, document: DocumentId) {
        self.documents.insert(document, workspace.to_string());
    }

    /// Workspaces known to this access control.
    pub fn workspaces(&self) -> HashSet<&str> {
        self.members
            .keys()
            .chain(self.documents.values())
            .map(String::as_str)
            .collect()
    }
}

#[async_trait]
impl AccessControl for StaticAccessControl {
    async fn authorize(&self, user: &UserId, document: &DocumentId) -> Option<Role> {
        let workspace = self.documents.get(document)?;
        self.members.get(workspace)?.get(user).copied()
    }
}

/// Issues and verifies session tokens of the form `<user>.<mac>`.
///
/// The MAC is a blake3 keyed hash of the user id, with the key derived from
/// a server secret.
#[derive(Clone)]
pub struct TokenVerifier {
    key: [u8; 32],
}

impl TokenVerifier {
    pub fn new(secret: &str) -> Self {
        Self {
            key: blake3::derive_key(TOKEN_KEY_CONTEXT, secret.as_bytes()),
        }
    }

    /// Creates a token for `user`.
    pub fn issue(&self, user: &UserId) -> String {
        format!("{}.{}", user, self.mac(user.as_str()).to_hex())
    }

    /// Returns the user a token was issued for, or `None` if it is forged or
    /// malformed.
    pub fn verify(&self, token: &str) -> Option<UserId> {
        let (user, mac) = token.rsplit_once('.')?;
        if user.is_empty() {
            return None;
        }
        let presented = blake3::Hash::from_hex(mac).ok()?;
        // `blake3::Hash` equality is constant time
        (presented == self.mac(user)).then(|| UserId::new(user))
    }

    fn mac(&self, user: &str) -> blake3::Hash {
        blake3::keyed_hash(&self.key, user.as_bytes())
    }
}

impl fmt::Debug for TokenVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenVerifier").finish_non_exhaustive()
    }
}

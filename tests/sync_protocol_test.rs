//! End-to-end protocol scenarios driven through sessions, without sockets.

use bytes::Bytes;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use collab_sync::config::Config;
use collab_sync::crdt::{Document, StateVector};
use collab_sync::{
    DocumentId, FileStore, MemoryStore, Outbound, Role, Session, SessionState, SnapshotStore,
    StaticAccessControl, SyncEngine, SyncMessage, UserId,
};

fn doc_id() -> DocumentId {
    DocumentId::parse("shared-note").unwrap()
}

fn config() -> Config {
    let mut config = Config::default();
    config.persistence.debounce_ms = 50;
    config.registry.eviction_grace_ms = 200;
    config.rooms.outbox_capacity = 16;
    config
}

fn access() -> Arc<StaticAccessControl> {
    let mut access = StaticAccessControl::new();
    access.add_member("team", UserId::new("alice"), Role::Editor);
    access.add_member("team", UserId::new("bob"), Role::Editor);
    access.add_member("team", UserId::new("vera"), Role::Viewer);
    access.bind_document("team", doc_id());
    Arc::new(access)
}

fn engine_with(store: Arc<dyn SnapshotStore>) -> Arc<SyncEngine> {
    SyncEngine::new(&config(), store, access())
}

/// Client side of one connection.
struct Client {
    session: Session,
    inbox: mpsc::Receiver<Bytes>,
    doc: Document,
    server_state: StateVector,
}

impl Client {
    async fn connect(engine: &Arc<SyncEngine>, user: &str) -> Client {
        let (outbox, inbox) = mpsc::channel(16);
        let (session, greeting) = Session::join(engine, doc_id(), UserId::new(user), outbox)
            .await
            .unwrap();

        let messages: Vec<SyncMessage> = greeting.iter().map(decode).collect();
        let replica_id = match messages[0] {
            SyncMessage::Welcome { replica_id } => replica_id,
            ref other => panic!("expected Welcome, got {other:?}"),
        };
        let server_state = match &messages[1] {
            SyncMessage::SyncStep1(state_vector) => state_vector.clone(),
            other => panic!("expected SyncStep1, got {other:?}"),
        };

        Client {
            session,
            inbox,
            doc: Document::new(replica_id),
            server_state,
        }
    }

    /// Runs the client half of the handshake.
    fn handshake(&mut self, engine: &SyncEngine) {
        let reply = self
            .send(engine, SyncMessage::SyncStep1(self.doc.current_state_vector()));
        match decode(&reply[0]) {
            SyncMessage::SyncStep2(update) => {
                self.doc.apply_update(&update);
            }
            other => panic!("expected SyncStep2, got {other:?}"),
        }
        let missing = self.doc.diff_since(&self.server_state);
        self.send(engine, SyncMessage::SyncStep2(missing));
    }

    fn type_text(&mut self, engine: &SyncEngine, index: usize, text: &str) -> Bytes {
        let before = self.doc.current_state_vector();
        self.doc.insert_str(index, text).unwrap();
        let frame = encode(SyncMessage::Update(self.doc.diff_since(&before)));
        self.send_frame(engine, &frame);
        frame
    }

    fn send(&mut self, engine: &SyncEngine, message: SyncMessage) -> Vec<Outbound> {
        self.send_frame(engine, &encode(message))
    }

    /// Delivers a frame the way the connection driver does.
    fn send_frame(&mut self, engine: &SyncEngine, frame: &Bytes) -> Vec<Outbound> {
        let outbound = self.session.handle_frame(frame).unwrap();
        let mut replies = Vec::new();
        for item in outbound {
            match item {
                Outbound::ToRoom(frame) => {
                    engine
                        .rooms()
                        .broadcast(self.session.document_id(), frame, self.session.connection());
                }
                reply @ Outbound::ToSender(_) => replies.push(reply),
            }
        }
        replies
    }

    /// Applies every frame broadcast to this client so far.
    fn drain(&mut self) -> usize {
        let mut received = 0;
        while let Ok(frame) = self.inbox.try_recv() {
            if let SyncMessage::Update(update) = SyncMessage::decode(&frame).unwrap() {
                self.doc.apply_update(&update);
            }
            received += 1;
        }
        received
    }
}

fn encode(message: SyncMessage) -> Bytes {
    Bytes::from(message.encode().unwrap())
}

fn decode(outbound: &Outbound) -> SyncMessage {
    match outbound {
        Outbound::ToSender(frame) | Outbound::ToRoom(frame) => SyncMessage::decode(frame).unwrap(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_first_client_on_empty_document() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone());

    let mut alice = Client::connect(&engine, "alice").await;
    assert!(alice.server_state.is_empty());

    // Offline edits made before the handshake reach the server in SyncStep2
    alice.doc.insert_str(0, "draft").unwrap();
    alice.handshake(&engine);
    assert_eq!(alice.session.state(), SessionState::Synced);

    let handle = engine.registry().acquire(&doc_id()).await.unwrap();
    assert_eq!(handle.content(), "draft");
    assert!(!store.contains(&doc_id()));

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(store.contains(&doc_id()));
    assert_eq!(store.write_count(), 1);
}

#[tokio::test]
async fn test_update_reaches_other_members_verbatim() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let mut alice = Client::connect(&engine, "alice").await;
    let mut bob = Client::connect(&engine, "bob").await;
    alice.handshake(&engine);
    bob.handshake(&engine);

    let sent = alice.type_text(&engine, 0, "hi bob");

    let received = bob.inbox.try_recv().unwrap();
    assert_eq!(received, sent);
    let SyncMessage::Update(update) = SyncMessage::decode(&received).unwrap() else {
        panic!("expected an Update frame");
    };
    bob.doc.apply_update(&update);
    assert_eq!(bob.doc.to_string(), "hi bob");

    // Never echoed to the sender
    assert_eq!(alice.drain(), 0);
}

#[tokio::test]
async fn test_concurrent_typing_converges() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let mut alice = Client::connect(&engine, "alice").await;
    let mut bob = Client::connect(&engine, "bob").await;
    alice.handshake(&engine);
    bob.handshake(&engine);

    alice.type_text(&engine, 0, "hello");
    bob.type_text(&engine, 0, "world");
    alice.drain();
    bob.drain();

    let handle = engine.registry().acquire(&doc_id()).await.unwrap();
    assert_eq!(alice.doc.to_string(), bob.doc.to_string());
    assert_eq!(handle.content(), alice.doc.to_string());
    assert_eq!(handle.content().len(), 10);
}

#[tokio::test]
async fn test_malformed_frame_only_affects_its_connection() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let mut alice = Client::connect(&engine, "alice").await;
    let mut bob = Client::connect(&engine, "bob").await;
    alice.type_text(&engine, 0, "ok");
    bob.drain();

    let garbage = Bytes::from_static(&[0x03, 0xFF, 0xFF, 0xFF]);
    assert!(bob.session.handle_frame(&garbage).is_err());
    bob.session.close();

    alice.type_text(&engine, 2, "!");
    let handle = engine.registry().acquire(&doc_id()).await.unwrap();
    assert_eq!(handle.content(), "ok!");
    assert_eq!(engine.rooms().member_count(&doc_id()), 1);
}

#[tokio::test(start_paused = true)]
async fn test_evicted_document_reloads_identically() {
    let store = Arc::new(MemoryStore::new());
    let engine = engine_with(store.clone());

    let mut alice = Client::connect(&engine, "alice").await;
    alice.type_text(&engine, 0, "survives eviction");
    let state_before = alice.doc.current_state_vector();
    drop(alice);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(!engine.registry().is_resident(&doc_id()));
    assert!(store.contains(&doc_id()));

    let mut bob = Client::connect(&engine, "bob").await;
    assert_eq!(bob.server_state, state_before);
    bob.handshake(&engine);
    assert_eq!(bob.doc.to_string(), "survives eviction");

    // New session never reuses an author's replica id
    assert!(bob.doc.replica_id() > state_before.max_replica_id().unwrap());
}

#[tokio::test]
async fn test_viewer_receives_but_cannot_edit() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let mut alice = Client::connect(&engine, "alice").await;
    let mut vera = Client::connect(&engine, "vera").await;
    assert_eq!(vera.session.role(), Role::Viewer);

    alice.type_text(&engine, 0, "read me");
    assert_eq!(vera.drain(), 1);
    assert_eq!(vera.doc.to_string(), "read me");

    vera.doc.insert(0, '!').unwrap();
    let update = vera.doc.diff_since(&alice.doc.current_state_vector());
    let replies = vera.send(&engine, SyncMessage::Update(update));
    assert!(matches!(
        decode(&replies[0]),
        SyncMessage::AccessDenied { .. }
    ));

    assert_eq!(alice.drain(), 0);
    let handle = engine.registry().acquire(&doc_id()).await.unwrap();
    assert_eq!(handle.content(), "read me");
}

#[tokio::test]
async fn test_change_notifications() {
    let engine = engine_with(Arc::new(MemoryStore::new()));
    let mut changes = engine.subscribe_changes();
    let mut alice = Client::connect(&engine, "alice").await;

    alice.type_text(&engine, 0, "abc");
    let change = changes.recv().await.unwrap();
    assert_eq!(change.document_id, doc_id());
    assert_eq!(change.content, "abc");
    assert_eq!(change.version, 3);
}

#[tokio::test]
async fn test_file_store_survives_restart() {
    let dir = tempfile::tempdir().unwrap();

    {
        let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
        let engine = engine_with(store);
        let mut alice = Client::connect(&engine, "alice").await;
        alice.type_text(&engine, 0, "on disk");
        assert_eq!(engine.shutdown().await, 1);
    }

    let store = Arc::new(FileStore::open(dir.path()).await.unwrap());
    let engine = engine_with(store);
    let mut bob = Client::connect(&engine, "bob").await;
    bob.handshake(&engine);
    assert_eq!(bob.doc.to_string(), "on disk");
}

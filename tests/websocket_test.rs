//! Live server tests over real WebSocket connections.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use collab_sync::config::Config;
use collab_sync::crdt::{Document, StateVector};
use collab_sync::server::{AppState, create_router};
use collab_sync::{
    DocumentId, MemoryStore, Role, StaticAccessControl, SyncEngine, SyncMessage, TokenVerifier,
    UserId,
};

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

const SECRET: &str = "websocket-test-secret";

async fn start_server() -> SocketAddr {
    let mut access = StaticAccessControl::new();
    access.add_member("team", UserId::new("alice"), Role::Editor);
    access.add_member("team", UserId::new("bob"), Role::Editor);
    access.bind_document("team", DocumentId::parse("live-doc").unwrap());

    let engine = SyncEngine::new(&Config::default(), Arc::new(MemoryStore::new()), Arc::new(access));
    let app = create_router(AppState::new(engine, TokenVerifier::new(SECRET)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn token(user: &str) -> String {
    TokenVerifier::new(SECRET).issue(&UserId::new(user))
}

async fn connect(addr: SocketAddr, user: &str) -> Socket {
    let url = format!("ws://{}/ws/live-doc?token={}", addr, token(user));
    let (socket, _) = connect_async(url.as_str()).await.unwrap();
    socket
}

async fn next_message(socket: &mut Socket) -> SyncMessage {
    loop {
        let frame = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection ended")
            .unwrap();
        match frame {
            Message::Binary(bytes) => return SyncMessage::decode(&bytes).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected frame {other:?}"),
        }
    }
}

async fn send(socket: &mut Socket, message: SyncMessage) {
    socket
        .send(Message::Binary(message.encode().unwrap()))
        .await
        .unwrap();
}

/// Reads the greeting and returns a local replica for the session.
async fn join(socket: &mut Socket) -> Document {
    let replica_id = match next_message(socket).await {
        SyncMessage::Welcome { replica_id } => replica_id,
        other => panic!("expected Welcome, got {other:?}"),
    };
    assert!(matches!(next_message(socket).await, SyncMessage::SyncStep1(_)));
    Document::new(replica_id)
}

#[tokio::test]
async fn test_health_endpoint_is_served() {
    let addr = start_server().await;
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();

    assert!(response.starts_with("HTTP/1.1 200"));
    assert!(response.contains(r#""status":"ok""#));
}

#[tokio::test]
async fn test_rejects_bad_token_and_bad_document_id() {
    let addr = start_server().await;

    let forged = format!("ws://{}/ws/live-doc?token=alice.00ff", addr);
    match connect_async(forged.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 401),
        other => panic!("expected 401, got {:?}", other.map(|_| ())),
    }

    let invalid = format!("ws://{}/ws/bad.id?token={}", addr, token("alice"));
    match connect_async(invalid.as_str()).await {
        Err(WsError::Http(response)) => assert_eq!(response.status().as_u16(), 400),
        other => panic!("expected 400, got {:?}", other.map(|_| ())),
    }
}

#[tokio::test]
async fn test_denied_user_gets_access_denied() {
    let addr = start_server().await;
    let mut mallory = connect(addr, "mallory").await;

    assert!(matches!(
        next_message(&mut mallory).await,
        SyncMessage::AccessDenied { .. }
    ));
}

#[tokio::test]
async fn test_updates_flow_between_clients() {
    let addr = start_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut alice_doc = join(&mut alice).await;
    let mut bob = connect(addr, "bob").await;
    let mut bob_doc = join(&mut bob).await;
    assert_ne!(alice_doc.replica_id(), bob_doc.replica_id());

    alice_doc.insert_str(0, "hello bob").unwrap();
    let update = alice_doc.diff_since(&StateVector::new());
    send(&mut alice, SyncMessage::Update(update.clone())).await;

    match next_message(&mut bob).await {
        SyncMessage::Update(received) => {
            assert_eq!(received, update);
            bob_doc.apply_update(&received);
        }
        other => panic!("expected Update, got {other:?}"),
    }
    assert_eq!(bob_doc.to_string(), "hello bob");

    // Alice's next frame is the answer to her SyncStep1, not an echo
    send(&mut alice, SyncMessage::SyncStep1(alice_doc.current_state_vector())).await;
    match next_message(&mut alice).await {
        SyncMessage::SyncStep2(missing) => assert!(missing.is_empty()),
        other => panic!("expected SyncStep2, got {other:?}"),
    }
}

#[tokio::test]
async fn test_malformed_frame_closes_only_that_connection() {
    let addr = start_server().await;
    let mut alice = connect(addr, "alice").await;
    let mut alice_doc = join(&mut alice).await;
    let mut bob = connect(addr, "bob").await;
    join(&mut bob).await;

    bob.send(Message::Binary(vec![0xFF, 0xFF, 0xFF])).await.unwrap();
    let closed = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(frame) = bob.next().await {
            match frame {
                Ok(Message::Close(_)) | Err(_) => break,
                Ok(_) => continue,
            }
        }
    })
    .await;
    assert!(closed.is_ok());

    // Alice's session is unaffected
    alice_doc.insert(0, 'x').unwrap();
    send(&mut alice, SyncMessage::Update(alice_doc.diff_since(&StateVector::new()))).await;
    send(&mut alice, SyncMessage::SyncStep1(StateVector::new())).await;
    match next_message(&mut alice).await {
        SyncMessage::SyncStep2(update) => assert_eq!(update.len(), 1),
        other => panic!("expected SyncStep2, got {other:?}"),
    }
}

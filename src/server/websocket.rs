//! WebSocket connection driver.
//!
//! One task per connection. It forwards binary frames from the socket into
//! the [`Session`] and writes back whatever the session produces, while also
//! draining the connection's room outbox. The connection ends when the client
//! closes, when a frame fails to decode, or when the room drops the outbox.

use axum::extract::ws::{CloseFrame, Message, WebSocket, close_code};
use bytes::Bytes;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

use crate::codec::SyncMessage;
use crate::engine::SyncEngine;
use crate::error::JoinError;
use crate::ids::{DocumentId, UserId};
use crate::session::{Outbound, Session};

type Sink = SplitSink<WebSocket, Message>;

/// WebSocket session manager
pub struct WebSocketSession {
    socket: WebSocket,
    engine: Arc<SyncEngine>,
    document_id: DocumentId,
    user: UserId,
}

impl WebSocketSession {
    pub fn new(socket: WebSocket, engine: Arc<SyncEngine>, document_id: DocumentId, user: UserId) -> Self {
        Self {
            socket,
            engine,
            document_id,
            user,
        }
    }

    /// Handle the WebSocket connection lifecycle
    pub async fn handle(self) {
        let (mut sink, mut stream) = self.socket.split();
        let (outbox, mut inbox) = mpsc::channel::<Bytes>(self.engine.outbox_capacity());

        let joined = Session::join(&self.engine, self.document_id.clone(), self.user.clone(), outbox).await;
        let (mut session, greeting) = match joined {
            Ok(joined) => joined,
            Err(JoinError::AccessDenied(document_id)) => {
                let reason = format!("no access to {document_id}");
                if let Ok(frame) = (SyncMessage::AccessDenied { reason }).encode() {
                    let _ = sink.send(Message::Binary(frame)).await;
                }
                close(&mut sink, close_code::POLICY, "access denied").await;
                return;
            }
            Err(e) => {
                error!("{} could not join {}: {}", self.user, self.document_id, e);
                close(&mut sink, close_code::ERROR, "document unavailable").await;
                return;
            }
        };

        if deliver(&mut sink, &self.engine, &session, greeting).await.is_err() {
            return;
        }

        loop {
            tokio::select! {
                incoming = stream.next() => match incoming {
                    Some(Ok(Message::Binary(data))) => {
                        match session.handle_frame(&Bytes::from(data)) {
                            Ok(outbound) => {
                                if deliver(&mut sink, &self.engine, &session, outbound).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                warn!("Dropping {} on {}: {}", session.connection(), self.document_id, e);
                                close(&mut sink, close_code::PROTOCOL, "malformed frame").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sink.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Text(_))) => {
                        warn!("Ignoring text frame from {}", session.connection());
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!("{} closed by client", session.connection());
                        break;
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket error for {}: {}", session.connection(), e);
                        break;
                    }
                },
                queued = inbox.recv() => match queued {
                    Some(frame) => {
                        if sink.send(Message::Binary(frame.to_vec())).await.is_err() {
                            break;
                        }
                    }
                    None => {
                        warn!("{} was removed from room {}", session.connection(), self.document_id);
                        close(&mut sink, close_code::AGAIN, "too slow").await;
                        break;
                    }
                },
            }
        }

        session.close();
    }
}

async fn deliver(
    sink: &mut Sink,
    engine: &SyncEngine,
    session: &Session,
    outbound: Vec<Outbound>,
) -> Result<(), axum::Error> {
    for item in outbound {
        match item {
            Outbound::ToSender(frame) => sink.send(Message::Binary(frame.to_vec())).await?,
            Outbound::ToRoom(frame) => {
                engine
                    .rooms()
                    .broadcast(session.document_id(), frame, session.connection());
            }
        }
    }
    Ok(())
}

async fn close(sink: &mut Sink, code: u16, reason: &'static str) {
    let frame = CloseFrame {
        code,
        reason: reason.into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
}

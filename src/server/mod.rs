//! Web server for the sync service.
//!
//! This module contains the Axum router and the WebSocket connection driver
//! that moves frames between a socket and its [`Session`](crate::session::Session).

pub mod routes;
pub mod websocket;

pub use routes::{AppState, create_router};

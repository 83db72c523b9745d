//! FLEETSYNC Backend - REST and WebSocket Adapters
//!
//! Implementations of the core backend seams for a managed Postgres service:
//! `RestBackend` reads and writes tables over a PostgREST-style HTTP API,
//! `WsChangeFeed` follows row changes over WebSocket.

pub mod config;
pub mod rest;
pub mod ws;

pub use config::BackendConfig;
pub use rest::{decode_rows, map_error_response, map_transport_error, query_params, RestBackend};
pub use ws::{decode_frame, subscribe_frame, unsubscribe_frame, WsChangeFeed};

//! A raw-TCP RFC 6455 websocket server and client pair, built around a
//! small set of async-trait collaborators (the frame transport, the
//! identification registries) rather than one monolithic connection type.
//!
//! [`server::Server`] accepts connections, negotiates the handshake, and
//! tracks ACTIVE sessions by id; sessions that disconnect are retained
//! PASSIVE for a grace period so a reconnecting peer presenting the same
//! `x-user-id` picks its session back up. [`client::Client`] is the other
//! half of the handshake.

#![warn(missing_docs)]

/// HTTP/1.1 request and response parsing for the handshake
pub mod context;
/// the error taxonomy used across the crate
pub mod errors;
/// events raised by the server and client lifecycles
pub mod events;
/// a map whose entries expire after a time-to-live
pub mod expiring_map;
/// websocket frame encoding, decoding, and the frame transport
pub mod frame;
/// the per-connection handshake and message-pump state machine
pub mod lifecycle;
/// the shared message pump driving a frame transport after handshake
pub mod pump;
/// the ACTIVE/PASSIVE session registries and identification monitor
pub mod registry;
/// tracked connection state: identity, metadata, outbound channel
pub mod session;
/// the narrow async stream boundary the handshake and transport depend on
pub mod stream;
/// the RFC 6455 HTTP upgrade handshake, both directions
pub mod upgrade;

/// the client half of a websocket connection
pub mod client;
/// the server half of a websocket connection
pub mod server;

pub use client::{Client, ClientOptions};
pub use errors::WsError;
pub use server::{Server, ServerOptions};
pub use session::ClientInfo;

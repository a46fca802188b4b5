//! error taxonomy for handshake, context parsing, and the server/client
//! lifecycle.

use thiserror::Error;

/// top-level error returned by every public operation in this crate
#[derive(Debug, Error)]
pub enum WsError {
    /// malformed HTTP, missing/invalid handshake headers, invalid accept
    /// token, bad request path
    #[error("upgrade failed: {0}")]
    Upgrade(#[from] UpgradeError),

    /// server-side failure: listener bound twice, unknown client id, send
    /// before connect, shutdown when not started, identity conflict
    #[error("server error: {0}")]
    Server(#[from] ServerError),

    /// client-side failure: connect when already connected, disconnect when
    /// already disconnecting, send while disconnected, codec uninitialized
    #[error("client error: {0}")]
    Client(#[from] ClientError),

    /// malformed [`WebContext`](crate::context::WebContext) access: missing
    /// required header, double body set, invalid status name
    #[error("context error: {0}")]
    Context(#[from] ContextError),

    /// passthrough I/O failure from the underlying stream
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// errors raised while performing or validating the RFC 6455 handshake
#[derive(Debug, Error)]
pub enum UpgradeError {
    /// the request did not carry the `Upgrade: websocket` / `Connection:
    /// Upgrade` pair required by §3 `IsWebSocketRequest`
    #[error("request is not a websocket upgrade request")]
    NotAWebSocketRequest,

    /// `Sec-WebSocket-Version` was present but not `13`
    #[error("unsupported websocket version `{0}`, only 13 is supported")]
    UnsupportedVersion(String),

    /// `Sec-WebSocket-Key` did not decode to exactly 16 bytes
    #[error("invalid Sec-WebSocket-Key")]
    InvalidKey,

    /// the client and server subprotocol lists could not be reconciled
    #[error("failed to negotiate a subprotocol")]
    SubprotocolNotNegotiated,

    /// the request path did not match `^/[A-Za-z0-9\-._~/]*$`
    #[error("invalid request path `{0}`")]
    InvalidPath(String),

    /// the response start-line was not `101 Switching Protocols`
    #[error("server did not switch protocols: {0}")]
    NotSwitchingProtocols(String),

    /// `Sec-WebSocket-Accept` was missing, or did not match the expected
    /// SHA-1+base64 digest of the sent key
    #[error("invalid or missing Sec-WebSocket-Accept header")]
    InvalidAcceptToken,

    /// the peer closed the stream before any handshake bytes arrived
    #[error("stream closed before handshake data arrived")]
    StreamClosedDuringHandshake,
}

/// errors raised by [`crate::server::Server`]
#[derive(Debug, Error)]
pub enum ServerError {
    /// `start` was called while the listener was already bound
    #[error("server is already listening")]
    AlreadyStarted,

    /// `shutdown` was called before `start`, or after a previous `shutdown`
    #[error("server is not started")]
    NotStarted,

    /// `shutdown` was called twice
    #[error("server is already shutting down")]
    AlreadyShuttingDown,

    /// `send_message`/`send_binary_message`/`get_client_by_id` referenced an
    /// id absent from the ACTIVE registry
    #[error("client not found")]
    ClientNotFound,

    /// the client was found but has no attached frame transport
    #[error("client is not connected")]
    ClientNotConnected,

    /// two concurrent upgrades claimed the same `x-user-id` while one was
    /// already ACTIVE
    #[error("user id already in use")]
    IdentityConflict,
}

/// errors raised by [`crate::client::Client`]
#[derive(Debug, Error)]
pub enum ClientError {
    /// `connect` was called while already connected
    #[error("client is already connected")]
    AlreadyConnected,

    /// `disconnect` was called while already disconnecting
    #[error("client is already disconnecting")]
    AlreadyDisconnecting,

    /// a send was attempted before `connect` completed, or after disconnect
    #[error("client is not connected")]
    NotConnected,
}

/// errors raised by [`crate::context::WebContext`]
#[derive(Debug, Error)]
pub enum ContextError {
    /// a request context was queried for `Host` but none was present
    #[error("missing required Host header")]
    MissingHost,

    /// the source text had no start-line
    #[error("missing start-line")]
    MissingStartLine,

    /// the start-line's status token did not parse as an integer
    #[error("invalid status code `{0}`")]
    InvalidStatusCode(String),

    /// `set_status` was called a second time on the same response context
    #[error("status code already set")]
    StatusAlreadySet,

    /// the body was written to more than once
    #[error("body already set")]
    BodyAlreadySet,
}

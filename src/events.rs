//! Events the server and client raise as sessions move through their
//! lifecycle. Handlers are registered as boxed async closures and fanned
//! out on their own spawned task so a slow subscriber never blocks the
//! message pump.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::context::WebContext;

/// an event raised by [`crate::server::Server`]
#[derive(Debug, Clone)]
pub enum ServerEvent {
    /// a peer completed the handshake and was registered ACTIVE
    ClientConnected { id: String, remote_endpoint: String },
    /// a text message arrived from an ACTIVE client
    MessageReceived { id: String, text: String },
    /// a binary message arrived from an ACTIVE client
    BinaryReceived { id: String, data: Vec<u8> },
    /// a client disconnected and moved to PASSIVE (or was dropped if
    /// retention is disabled)
    ClientDisconnected { id: String, code: Option<u16>, reason: String },
    /// a PASSIVE session's retention period elapsed and it was dropped
    /// without being reclaimed
    PassiveUserExpired { id: String },
    /// the listener stopped accepting new connections
    ServerStopped,
}

/// an event raised by [`crate::client::Client`]
#[derive(Debug, Clone)]
pub enum ClientEvent {
    /// the handshake completed and the connection is open
    Connected { confirmed_id: Option<String> },
    /// a text message arrived from the server
    MessageReceived { text: String },
    /// a binary message arrived from the server
    BinaryReceived { data: Vec<u8> },
    /// the connection closed, locally or remotely initiated
    Disconnected { code: Option<u16>, reason: String },
}

/// outcome of the upgrade callback a server owner can register to approve
/// or reject a handshake before it's accepted
pub enum UpgradeDecision {
    /// accept the connection, optionally overriding the response template
    Accept(WebContext),
    /// reject the connection with the given response
    Reject(WebContext),
}

type AsyncBoxFn<Args, Out> =
    Arc<dyn Fn(Args) -> Pin<Box<dyn Future<Output = Out> + Send>> + Send + Sync>;

/// the callback invoked once per incoming request, before the handshake is
/// accepted, to approve or reject the connection.
pub type UpgradeCallback = AsyncBoxFn<WebContext, UpgradeDecision>;

/// one subscriber to [`ServerEvent`]s
pub type ServerEventHandler = AsyncBoxFn<ServerEvent, ()>;

/// one subscriber to [`ClientEvent`]s
pub type ClientEventHandler = AsyncBoxFn<ClientEvent, ()>;

/// fan `event` out to every handler on its own spawned task, so a slow or
/// panicking handler never blocks the caller.
pub fn dispatch_server_event(handlers: &[ServerEventHandler], event: ServerEvent) {
    for handler in handlers {
        let handler = Arc::clone(handler);
        let event = event.clone();
        tokio::spawn(async move { handler(event).await });
    }
}

/// fan `event` out to every handler on its own spawned task
pub fn dispatch_client_event(handlers: &[ClientEventHandler], event: ClientEvent) {
    for handler in handlers {
        let handler = Arc::clone(handler);
        let event = event.clone();
        tokio::spawn(async move { handler(event).await });
    }
}

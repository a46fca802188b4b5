//! The public server surface: bind a listener, accept connections on their
//! own task, and expose the ACTIVE registry to application code for
//! sending messages and querying who's connected.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::errors::{ServerError, WsError};
use crate::events::{
    dispatch_server_event, ServerEvent, ServerEventHandler, UpgradeCallback,
};
use crate::frame::transport::DefaultFrameTransportFactory;
use crate::lifecycle::{self, LifecycleConfig};
use crate::registry::{ActiveRegistry, IdentificationMonitor, PassiveRegistry};
use crate::session::Outbound;
use crate::stream::describe_peer;

/// the retention period PASSIVE sessions are kept re-identifiable for
/// before being dropped, unless overridden with [`ServerOptions::passive_retention`].
pub const DEFAULT_PASSIVE_RETENTION: Duration = Duration::from_secs(60);

/// configuration consumed by [`Server::new`]
pub struct ServerOptions {
    pub bind_addr: String,
    /// `remember_disconnected_clients`: when `false`, a disconnecting
    /// client's session is dropped instead of being retained for
    /// re-identification, and any `x-user-id` on an incoming request is
    /// ignored rather than used to resolve identity
    pub retain_passive: bool,
    /// `remove_passive_clients_after_expiration`: when `true`, PASSIVE
    /// sessions are dropped `passive_retention` after being retained; when
    /// `false`, they're kept until explicitly reclaimed. Has no effect
    /// unless `retain_passive` is also set.
    pub expire_passive: bool,
    /// `passive_client_lifetime`: TTL for PASSIVE entries when
    /// `expire_passive` is set
    pub passive_retention: Duration,
    pub desired_subprotocol: Option<String>,
    pub send_user_id_to_client: bool,
    pub upgrade_callback: Option<UpgradeCallback>,
    pub event_handlers: Vec<ServerEventHandler>,
    /// size of the handshake read buffer (see [`crate::upgrade::await_context`])
    pub read_buffer_size: usize,
    /// `tracing` target this server instance logs under
    pub log_target: &'static str,
}

/// default handshake read buffer size, matching the teacher's own
/// single-shot read buffer sizing
pub const DEFAULT_READ_BUFFER_SIZE: usize = 1024;

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:0".to_string(),
            passive_retention: DEFAULT_PASSIVE_RETENTION,
            retain_passive: false,
            expire_passive: false,
            desired_subprotocol: None,
            send_user_id_to_client: false,
            upgrade_callback: None,
            event_handlers: Vec::new(),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
            log_target: "ws_hub",
        }
    }
}

/// a cheap, cloneable handle to a server's ACTIVE registry, usable from
/// inside an event handler (which only ever sees a `&Server` by borrowing
/// rules, not a way to reach back into the server that's driving it).
#[derive(Clone)]
pub struct ServerHandle {
    active: ActiveRegistry,
}

impl ServerHandle {
    /// send a text message to the ACTIVE client `id`
    pub async fn send_message(&self, id: &str, text: impl Into<String>) -> Result<(), WsError> {
        let sender = self.active.outbound_sender(id).await?;
        sender
            .send(Outbound::Text(text.into()))
            .await
            .map_err(|_| WsError::Server(ServerError::ClientNotConnected))
    }

    /// send a binary message to the ACTIVE client `id`
    pub async fn send_binary_message(&self, id: &str, data: Vec<u8>) -> Result<(), WsError> {
        let sender = self.active.outbound_sender(id).await?;
        sender
            .send(Outbound::Binary(data))
            .await
            .map_err(|_| WsError::Server(ServerError::ClientNotConnected))
    }

    /// `true` iff `id` is currently ACTIVE
    pub async fn client_exists(&self, id: &str) -> bool {
        self.active.contains(id).await
    }
}

/// a running (or not-yet-started) websocket server: one accept loop, an
/// ACTIVE session registry, and a PASSIVE registry for re-identification.
pub struct Server {
    options: ServerOptions,
    active: ActiveRegistry,
    passive: PassiveRegistry,
    monitor: IdentificationMonitor,
    factory: Arc<DefaultFrameTransportFactory>,
    started: Arc<AtomicBool>,
    shutdown_tx: Option<mpsc::Sender<()>>,
    accept_task: Option<tokio::task::JoinHandle<()>>,
    local_addr: Option<std::net::SocketAddr>,
}

impl Server {
    /// build a server bound to `options.bind_addr`; call [`Server::start`]
    /// to begin accepting connections.
    pub fn new(options: ServerOptions) -> Self {
        Self {
            passive: PassiveRegistry::new(),
            options,
            active: ActiveRegistry::new(),
            monitor: IdentificationMonitor::new(),
            factory: Arc::new(DefaultFrameTransportFactory),
            started: Arc::new(AtomicBool::new(false)),
            shutdown_tx: None,
            accept_task: None,
            local_addr: None,
        }
    }

    /// bind the listener and spawn the accept loop. Errors if already
    /// started.
    pub async fn start(&mut self) -> Result<(), WsError> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(WsError::Server(ServerError::AlreadyStarted));
        }
        let listener = TcpListener::bind(&self.options.bind_addr).await?;
        self.local_addr = Some(listener.local_addr()?);
        info!(log_target = self.options.log_target, addr = %self.options.bind_addr, "server listening");

        let (shutdown_tx, mut shutdown_rx) = mpsc::channel(1);
        self.shutdown_tx = Some(shutdown_tx);

        // rebuild the PASSIVE registry now that `on_event` handlers
        // registered after `new` are final, so expired-entry notifications
        // reach every subscriber.
        self.passive = if self.options.expire_passive {
            let expiry_handlers = self.options.event_handlers.clone();
            PassiveRegistry::new_expiring_with_handler(
                self.options.passive_retention,
                Some(Arc::new(move |session: crate::session::Session| {
                    dispatch_server_event(
                        &expiry_handlers,
                        ServerEvent::PassiveUserExpired { id: session.id().to_string() },
                    );
                })),
            )
        } else {
            PassiveRegistry::new()
        };

        let config = LifecycleConfig {
            active: self.active.clone(),
            passive: self.passive.clone(),
            monitor: self.monitor.clone(),
            factory: Arc::clone(&self.factory),
            upgrade_callback: self.options.upgrade_callback.clone(),
            desired_subprotocol: self.options.desired_subprotocol.clone(),
            send_user_id_to_client: self.options.send_user_id_to_client,
            retain_passive: self.options.retain_passive,
            event_handlers: self.options.event_handlers.clone(),
            read_buffer_size: self.options.read_buffer_size,
            log_target: self.options.log_target,
        };
        let started = Arc::clone(&self.started);

        let accept_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    _ = shutdown_rx.recv() => {
                        debug!("accept loop received shutdown signal");
                        break;
                    }
                    accepted = listener.accept() => {
                        match accepted {
                            Ok((stream, addr)) => {
                                spawn_connection(stream, addr, config.clone());
                            }
                            Err(e) => {
                                warn!(error = %e, "failed to accept connection");
                            }
                        }
                    }
                }
            }
            started.store(false, Ordering::SeqCst);
            dispatch_server_event(&config.event_handlers, ServerEvent::ServerStopped);
        });
        self.accept_task = Some(accept_task);
        Ok(())
    }

    /// stop accepting new connections, then close every ACTIVE session with
    /// close code 1001 ("going away") and reason "Server is shutting down"
    /// before waiting for the accept loop to exit.
    pub async fn shutdown(&mut self) -> Result<(), WsError> {
        let Some(shutdown_tx) = self.shutdown_tx.take() else {
            return Err(WsError::Server(ServerError::NotStarted));
        };
        if shutdown_tx.send(()).await.is_err() {
            return Err(WsError::Server(ServerError::AlreadyShuttingDown));
        }

        for id in self.active.ids().await {
            if let Ok(sender) = self.active.outbound_sender(&id).await {
                let _ = sender
                    .send(Outbound::Close(1001, "Server is shutting down".to_string()))
                    .await;
            }
        }

        if let Some(task) = self.accept_task.take() {
            let _ = task.await;
        }
        Ok(())
    }

    /// `true` while the accept loop is running
    pub fn is_listening(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// the bound local address, once [`Server::start`] has completed
    pub fn local_addr(&self) -> Option<std::net::SocketAddr> {
        self.local_addr
    }

    /// a cheap, cloneable handle usable from within an event handler to
    /// reach back into this server's ACTIVE registry
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            active: self.active.clone(),
        }
    }

    /// register an event handler; only takes effect for handlers added
    /// before [`Server::start`] is called
    pub fn on_event(&mut self, handler: ServerEventHandler) {
        self.options.event_handlers.push(handler);
    }

    /// send a text message to the ACTIVE client `id`
    pub async fn send_message(&self, id: &str, text: impl Into<String>) -> Result<(), WsError> {
        let sender = self.active.outbound_sender(id).await?;
        sender
            .send(Outbound::Text(text.into()))
            .await
            .map_err(|_| WsError::Server(ServerError::ClientNotConnected))
    }

    /// send a binary message to the ACTIVE client `id`
    pub async fn send_binary_message(&self, id: &str, data: Vec<u8>) -> Result<(), WsError> {
        let sender = self.active.outbound_sender(id).await?;
        sender
            .send(Outbound::Binary(data))
            .await
            .map_err(|_| WsError::Server(ServerError::ClientNotConnected))
    }

    /// `true` iff `id` is currently ACTIVE
    pub async fn client_exists(&self, id: &str) -> bool {
        self.active.contains(id).await
    }

    /// a read-only snapshot of the ACTIVE client `id`, or
    /// [`ServerError::ClientNotFound`] if it isn't currently ACTIVE
    pub async fn get_client_by_id(&self, id: &str) -> Result<crate::session::ClientInfo, WsError> {
        self.active
            .info(id)
            .await
            .ok_or(WsError::Server(ServerError::ClientNotFound))
    }

    /// every currently ACTIVE client id
    pub async fn client_ids(&self) -> Vec<String> {
        self.active.ids().await
    }

    /// number of currently ACTIVE clients
    pub async fn client_count(&self) -> usize {
        self.active.count().await
    }
}

fn spawn_connection(
    stream: TcpStream,
    addr: std::net::SocketAddr,
    config: LifecycleConfig<DefaultFrameTransportFactory>,
) {
    let remote_endpoint = describe_peer(Some(addr));
    tokio::spawn(async move {
        if let Err(e) = lifecycle::handle_connection(stream, remote_endpoint, config).await {
            debug!(error = %e, "connection ended with an error");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn start_twice_is_an_error() {
        let mut server = Server::new(ServerOptions::default());
        server.start().await.unwrap();
        assert!(matches!(
            server.start().await,
            Err(WsError::Server(ServerError::AlreadyStarted))
        ));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_start_is_an_error() {
        let mut server = Server::new(ServerOptions::default());
        assert!(matches!(
            server.shutdown().await,
            Err(WsError::Server(ServerError::NotStarted))
        ));
    }

    #[tokio::test]
    async fn send_to_unknown_client_is_client_not_found() {
        let mut server = Server::new(ServerOptions::default());
        server.start().await.unwrap();
        assert!(matches!(
            server.send_message("nobody", "hi").await,
            Err(WsError::Server(ServerError::ClientNotFound))
        ));
        server.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn get_client_by_id_fails_for_an_unknown_id() {
        let mut server = Server::new(ServerOptions::default());
        server.start().await.unwrap();
        assert!(matches!(
            server.get_client_by_id("nobody").await,
            Err(WsError::Server(ServerError::ClientNotFound))
        ));
        server.shutdown().await.unwrap();
    }
}

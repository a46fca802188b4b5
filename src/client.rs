//! The public client surface: connect to a server, exchange text/binary
//! messages, and disconnect — mirroring [`crate::server::Server`]'s shape
//! from the other side of the handshake.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::debug;

use crate::context::Direction;
use crate::errors::{ClientError, WsError};
use crate::events::{dispatch_client_event, ClientEvent, ClientEventHandler};
use crate::frame::transport::DefaultFrameTransportFactory;
use crate::pump::{self, PumpMessage};
use crate::session::Outbound;
use crate::upgrade;

/// configuration consumed by [`Client::new`]
pub struct ClientOptions {
    pub host: String,
    pub port: u16,
    pub path: String,
    /// the `x-user-id` to present for re-identification across reconnects
    pub user_id: Option<String>,
    pub extra_headers: Vec<(String, String)>,
    pub event_handlers: Vec<ClientEventHandler>,
    /// size of the handshake read buffer, see [`crate::upgrade::await_context`]
    pub read_buffer_size: usize,
    /// `tracing` target this client instance logs under
    pub log_target: &'static str,
}

impl ClientOptions {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            path: "/".to_string(),
            user_id: None,
            extra_headers: Vec::new(),
            event_handlers: Vec::new(),
            read_buffer_size: 1024,
            log_target: "ws_hub",
        }
    }
}

/// a websocket client connection, driven by its own background pump task
/// once [`Client::connect`] completes.
pub struct Client {
    options: ClientOptions,
    connected: Arc<AtomicBool>,
    disconnecting: AtomicBool,
    outbound_tx: Option<mpsc::Sender<Outbound>>,
    pump_task: Option<tokio::task::JoinHandle<Result<(), WsError>>>,
    confirmed_id: Option<String>,
}

impl Client {
    pub fn new(options: ClientOptions) -> Self {
        Self {
            options,
            connected: Arc::new(AtomicBool::new(false)),
            disconnecting: AtomicBool::new(false),
            outbound_tx: None,
            pump_task: None,
            confirmed_id: None,
        }
    }

    /// perform the TCP connect and handshake, then spawn the background
    /// pump task. Errors if already connected.
    pub async fn connect(&mut self) -> Result<(), WsError> {
        if self.connected.swap(true, Ordering::SeqCst) {
            return Err(WsError::Client(ClientError::AlreadyConnected));
        }
        self.disconnecting.store(false, Ordering::SeqCst);
        match self.connect_inner().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(e)
            }
        }
    }

    async fn connect_inner(&mut self) -> Result<(), WsError> {
        debug!(
            log_target = self.options.log_target,
            host = %self.options.host,
            port = self.options.port,
            "dialing server"
        );
        let mut stream = TcpStream::connect((self.options.host.as_str(), self.options.port)).await?;
        let sent_key = upgrade::send_upgrade_request(
            &mut stream,
            &self.options.host,
            self.options.port,
            &self.options.path,
            self.options.user_id.as_deref(),
            &self.options.extra_headers,
        )
        .await?;

        let response =
            upgrade::await_context(&mut stream, Direction::Response, self.options.read_buffer_size)
                .await?;
        let confirmed_id =
            upgrade::validate_upgrade_response(&response, &sent_key).map_err(WsError::Upgrade)?;
        self.confirmed_id = confirmed_id.clone().or_else(|| self.options.user_id.clone());

        let negotiated = response.get_all_values("Sec-WebSocket-Protocol").into_iter().next();
        let mut transport =
            upgrade::create_transport(&DefaultFrameTransportFactory, stream, false, negotiated);

        let (outbound_tx, outbound_rx) = mpsc::channel(32);
        self.outbound_tx = Some(outbound_tx);

        let (msg_tx, mut msg_rx) = mpsc::channel(32);
        let handlers = self.options.event_handlers.clone();
        let connected_flag = Arc::clone(&self.connected);

        dispatch_client_event(&handlers, ClientEvent::Connected { confirmed_id });

        let forward_handlers = handlers.clone();
        let forward_task = tokio::spawn(async move {
            while let Some(message) = msg_rx.recv().await {
                let event = match message {
                    PumpMessage::Text(text) => ClientEvent::MessageReceived { text },
                    PumpMessage::Binary(data) => ClientEvent::BinaryReceived { data },
                    PumpMessage::Closed { code, reason } => ClientEvent::Disconnected { code, reason },
                };
                dispatch_client_event(&forward_handlers, event);
            }
        });

        let pump_task = tokio::spawn(async move {
            let result = pump::run(transport.as_mut(), msg_tx, outbound_rx).await;
            connected_flag.store(false, Ordering::SeqCst);
            let _ = forward_task.await;
            result
        });
        self.pump_task = Some(pump_task);
        Ok(())
    }

    /// send a text message
    pub async fn send_message(&self, text: impl Into<String>) -> Result<(), WsError> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or(WsError::Client(ClientError::NotConnected))?;
        tx.send(Outbound::Text(text.into()))
            .await
            .map_err(|_| WsError::Client(ClientError::NotConnected))
    }

    /// send a binary message
    pub async fn send_binary_message(&self, data: Vec<u8>) -> Result<(), WsError> {
        let tx = self
            .outbound_tx
            .as_ref()
            .ok_or(WsError::Client(ClientError::NotConnected))?;
        tx.send(Outbound::Binary(data))
            .await
            .map_err(|_| WsError::Client(ClientError::NotConnected))
    }

    /// send a close frame carrying `reason` and wait for the pump task to
    /// finish. Errors if already disconnecting, or if never connected.
    pub async fn disconnect(&mut self, reason: impl Into<String>) -> Result<(), WsError> {
        if self.disconnecting.swap(true, Ordering::SeqCst) {
            return Err(WsError::Client(ClientError::AlreadyDisconnecting));
        }
        let Some(tx) = self.outbound_tx.take() else {
            return Err(WsError::Client(ClientError::NotConnected));
        };
        // only write a close frame if the transport might still be open or
        // mid-close; once the pump has already torn it down there's nothing
        // left to send it on.
        if self.connected.load(Ordering::SeqCst) {
            let _ = tx.send(Outbound::Close(1000, reason.into())).await;
        }
        drop(tx);
        if let Some(task) = self.pump_task.take() {
            match task.await {
                Ok(result) => result?,
                Err(e) => debug!(error = %e, "pump task panicked"),
            }
        }
        Ok(())
    }

    /// `true` while the background pump task is running
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// the `x-user-id` confirmed by the server's handshake response, if any
    pub fn user_id(&self) -> Option<&str> {
        self.confirmed_id.as_deref()
    }
}

//! The per-connection state machine: read the request, resolve identity
//! under the identification monitor, run the upgrade callback, accept or
//! reject the handshake, then hand off to the message pump until the peer
//! disconnects.

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::debug;

use crate::context::{Direction, WebContext};
use crate::errors::{ServerError, WsError};
use crate::events::{dispatch_server_event, ServerEvent, ServerEventHandler, UpgradeCallback, UpgradeDecision};
use crate::frame::transport::FrameTransportFactory;
use crate::pump::{self, PumpMessage};
use crate::registry::{ActiveRegistry, IdentificationMonitor, PassiveRegistry};
use crate::session::Session;
use crate::stream::AsyncDuplexStream;
use crate::upgrade;

/// everything a connection needs beyond its own stream: the registries, the
/// identification monitor, the frame transport factory, and the handlers a
/// [`crate::server::Server`] was configured with. Cheap to clone — every
/// field is an `Arc`-backed handle.
#[derive(Clone)]
pub struct LifecycleConfig<F> {
    pub active: ActiveRegistry,
    pub passive: PassiveRegistry,
    pub monitor: IdentificationMonitor,
    pub factory: Arc<F>,
    pub upgrade_callback: Option<UpgradeCallback>,
    pub desired_subprotocol: Option<String>,
    pub send_user_id_to_client: bool,
    pub retain_passive: bool,
    pub event_handlers: Vec<ServerEventHandler>,
    /// size of the handshake read buffer, see [`crate::upgrade::await_context`]
    pub read_buffer_size: usize,
    /// `tracing` target this connection's events are logged under
    pub log_target: &'static str,
}

/// resolve the confirmed id for an incoming request, reserving it in the
/// ACTIVE registry under the identification monitor's critical section.
/// Identification (reusing a matching PASSIVE session, or rejecting with
/// [`ServerError::IdentityConflict`] on an ACTIVE collision) only runs when
/// `retain_passive` is enabled and the request carries an `x-user-id`;
/// otherwise a fresh session is minted and the header is ignored.
async fn reserve_identity<F>(
    config: &LifecycleConfig<F>,
    request: &WebContext,
    remote_endpoint: &str,
) -> Result<String, ServerError> {
    let requested_id = if config.retain_passive {
        request.user_id()
    } else {
        None
    };
    config
        .monitor
        .locked(|| async {
            if let Some(id) = &requested_id {
                if config.active.contains(id).await {
                    return Err(ServerError::IdentityConflict);
                }
            }
            let mut session = match &requested_id {
                Some(id) => match config.passive.take(id).await {
                    Some(mut retained) => {
                        retained.touch();
                        retained
                    }
                    None => Session::new(remote_endpoint.to_string()),
                },
                None => Session::new(remote_endpoint.to_string()),
            };
            if let Some(id) = &requested_id {
                session
                    .update_id(id)
                    .map_err(|_| ServerError::IdentityConflict)?;
            }
            let id = session.id().to_string();
            config.active.insert(session).await;
            Ok(id)
        })
        .await
}

/// drive one accepted connection from its raw stream through the full
/// handshake and message pump lifecycle.
pub async fn handle_connection<S, F>(
    mut stream: S,
    remote_endpoint: String,
    config: LifecycleConfig<F>,
) -> Result<(), WsError>
where
    S: AsyncDuplexStream + 'static,
    F: FrameTransportFactory<S>,
{
    debug!(
        log_target = config.log_target,
        remote_endpoint = %remote_endpoint,
        "accepted connection, awaiting handshake request"
    );
    let request =
        upgrade::await_context(&mut stream, Direction::Request, config.read_buffer_size).await?;

    let confirmed_id = match reserve_identity(&config, &request, &remote_endpoint).await {
        Ok(id) => id,
        Err(ServerError::IdentityConflict) => {
            let mut response = WebContext::new_response();
            response.set_status(409, "Conflict")?;
            response.set_body("User id already in use")?;
            upgrade::reject(&mut stream, &response).await?;
            return Err(WsError::Server(ServerError::IdentityConflict));
        }
        Err(other) => return Err(WsError::Server(other)),
    };

    let decision = match &config.upgrade_callback {
        Some(callback) => callback(request.clone()).await,
        None => UpgradeDecision::Accept(WebContext::new_response()),
    };

    let response_template = match decision {
        UpgradeDecision::Reject(response) => {
            upgrade::reject(&mut stream, &response).await?;
            config.active.remove(&confirmed_id).await;
            return Ok(());
        }
        UpgradeDecision::Accept(template) => template,
    };

    let negotiated = match upgrade::accept(
        &mut stream,
        &request,
        &response_template,
        &confirmed_id,
        config.desired_subprotocol.as_deref(),
        config.send_user_id_to_client,
    )
    .await
    {
        Ok(negotiated) => negotiated,
        Err(e) => {
            config.active.remove(&confirmed_id).await;
            return Err(e);
        }
    };

    let mut transport = upgrade::create_transport(&*config.factory, stream, true, negotiated.clone());

    let (outbound_tx, outbound_rx) = mpsc::channel(32);
    config
        .active
        .with_session(&confirmed_id, |session| {
            let _ = session.attach_outbound(outbound_tx);
            if let Some(protocol) = &negotiated {
                session.set_property("subprotocol", protocol.clone());
            }
        })
        .await?;

    dispatch_server_event(
        &config.event_handlers,
        ServerEvent::ClientConnected {
            id: confirmed_id.clone(),
            remote_endpoint: remote_endpoint.clone(),
        },
    );

    let (msg_tx, mut msg_rx) = mpsc::channel(32);
    let forward_handlers = config.event_handlers.clone();
    let forward_id = confirmed_id.clone();
    let forward_task = tokio::spawn(async move {
        while let Some(message) = msg_rx.recv().await {
            let event = match message {
                PumpMessage::Text(text) => ServerEvent::MessageReceived {
                    id: forward_id.clone(),
                    text,
                },
                PumpMessage::Binary(data) => ServerEvent::BinaryReceived {
                    id: forward_id.clone(),
                    data,
                },
                PumpMessage::Closed { code, reason } => ServerEvent::ClientDisconnected {
                    id: forward_id.clone(),
                    code,
                    reason,
                },
            };
            dispatch_server_event(&forward_handlers, event);
        }
    });

    let pump_result = pump::run(transport.as_mut(), msg_tx, outbound_rx).await;
    let _ = forward_task.await;

    if let Some(mut session) = config.active.remove(&confirmed_id).await {
        session.disconnect();
        if config.retain_passive {
            config.passive.put(session).await;
        }
    }

    pump_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::transport::DefaultFrameTransportFactory;
    use std::time::Duration;

    fn test_config() -> LifecycleConfig<DefaultFrameTransportFactory> {
        LifecycleConfig {
            active: ActiveRegistry::new(),
            passive: PassiveRegistry::new_expiring(Duration::from_secs(30)),
            monitor: IdentificationMonitor::new(),
            factory: Arc::new(DefaultFrameTransportFactory),
            upgrade_callback: None,
            desired_subprotocol: None,
            send_user_id_to_client: false,
            retain_passive: true,
            event_handlers: Vec::new(),
            read_buffer_size: 1024,
            log_target: "ws_hub",
        }
    }

    #[tokio::test]
    async fn accepts_a_well_formed_handshake_and_echoes_a_message() {
        let config = test_config();
        let (mut client_io, server_io) = tokio::io::duplex(8192);

        let sent_key = upgrade::send_upgrade_request(
            &mut client_io,
            "example.com",
            9000,
            "/chat",
            Some("user-1"),
            &[],
        )
        .await
        .unwrap();

        let server_task = tokio::spawn(handle_connection(
            server_io,
            "127.0.0.1:1".to_string(),
            config.clone(),
        ));

        let response = upgrade::await_context(&mut client_io, Direction::Response, 1024)
            .await
            .unwrap();
        upgrade::validate_upgrade_response(&response, &sent_key).unwrap();

        let mut client_transport =
            crate::frame::transport::DefaultFrameTransport::new(client_io, false);
        client_transport.close(1000, "done").await.unwrap();

        server_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn rejects_a_conflicting_identity() {
        let config = test_config();
        config
            .active
            .insert({
                let mut s = Session::new("127.0.0.1:1");
                s.update_id("user-1").unwrap();
                s
            })
            .await;

        let (mut client_io, server_io) = tokio::io::duplex(8192);
        upgrade::send_upgrade_request(
            &mut client_io,
            "example.com",
            9000,
            "/chat",
            Some("user-1"),
            &[],
        )
        .await
        .unwrap();

        let result = handle_connection(server_io, "127.0.0.1:2".to_string(), config).await;
        assert!(matches!(
            result,
            Err(WsError::Server(ServerError::IdentityConflict))
        ));
    }
}

//! The message pump: the loop that drives a [`FrameTransport`] after the
//! handshake completes, translating received frames into events and
//! writing queued outbound messages, stopping cleanly on close or
//! disconnect. Shared by the server's per-connection task and the client.

use tokio::sync::mpsc;

use crate::errors::WsError;
use crate::frame::transport::{FrameTransport, Received, TransportState};
use crate::session::Outbound;

/// one message surfaced by the pump to its caller
#[derive(Debug, Clone)]
pub enum PumpMessage {
    Text(String),
    Binary(Vec<u8>),
    Closed { code: Option<u16>, reason: String },
}

/// drive `transport` until it reports closed or `outbound` is dropped,
/// forwarding inbound application messages to `out` and writing anything
/// sent on `outbound` to the wire. Returns once the transport is closed;
/// the caller decides what that means for the owning session.
pub async fn run(
    transport: &mut dyn FrameTransport,
    out: mpsc::Sender<PumpMessage>,
    mut outbound: mpsc::Receiver<Outbound>,
) -> Result<(), WsError> {
    while transport.state() == TransportState::Open {
        tokio::select! {
            biased;
            message = outbound.recv() => {
                match message {
                    None => {
                        let _ = transport.close(1000, "going away").await;
                        let _ = out.send(PumpMessage::Closed { code: Some(1000), reason: "going away".into() }).await;
                        return Ok(());
                    }
                    Some(Outbound::Text(text)) => transport.send_text(&text).await?,
                    Some(Outbound::Binary(data)) => transport.send_binary(&data).await?,
                    Some(Outbound::Close(code, reason)) => {
                        transport.close(code, &reason).await?;
                        let _ = out.send(PumpMessage::Closed { code: Some(code), reason }).await;
                        return Ok(());
                    }
                }
            }
            received = transport.receive() => {
                match received? {
                    Received::Text(text) => {
                        if out.send(PumpMessage::Text(text)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Received::Binary(data) => {
                        if out.send(PumpMessage::Binary(data)).await.is_err() {
                            return Ok(());
                        }
                    }
                    Received::Closed { code, reason } => {
                        // the peer closed first (state just moved Open ->
                        // Closing); complete the RFC 6455 closing handshake
                        // with a normal-closure reply. If we'd already sent
                        // our own close, state was already past Open and we
                        // wouldn't have re-entered this loop iteration.
                        if transport.state() == TransportState::Closing {
                            let _ = transport.close(1000, "Closing").await;
                        }
                        let _ = out.send(PumpMessage::Closed { code, reason }).await;
                        return Ok(());
                    }
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::transport::DefaultFrameTransport;

    #[tokio::test]
    async fn pump_forwards_text_until_peer_closes() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = DefaultFrameTransport::new(client_io, false);
        let mut server = DefaultFrameTransport::new(server_io, true);

        let (tx, mut rx) = mpsc::channel(8);
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);

        let pump_task = tokio::spawn(async move { run(&mut server, tx, outbound_rx).await });

        client.send_text("hello").await.unwrap();
        client.close(1000, "bye").await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, PumpMessage::Text(t) if t == "hello"));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, PumpMessage::Closed { .. }));

        pump_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pump_writes_outbound_text_to_the_wire() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = DefaultFrameTransport::new(client_io, false);
        let mut server = DefaultFrameTransport::new(server_io, true);

        let (tx, _rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);

        let pump_task = tokio::spawn(async move { run(&mut server, tx, outbound_rx).await });
        outbound_tx
            .send(Outbound::Text("hi there".into()))
            .await
            .unwrap();

        match client.receive().await.unwrap() {
            Received::Text(text) => assert_eq!(text, "hi there"),
            other => panic!("unexpected {other:?}"),
        }

        drop(outbound_tx);
        pump_task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn pump_stops_when_outbound_sender_is_dropped() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = DefaultFrameTransport::new(client_io, false);
        let mut server = DefaultFrameTransport::new(server_io, true);

        let (tx, mut rx) = mpsc::channel(8);
        let (outbound_tx, outbound_rx) = mpsc::channel(1);

        let pump_task = tokio::spawn(async move { run(&mut server, tx, outbound_rx).await });
        drop(outbound_tx);

        let message = rx.recv().await.unwrap();
        assert!(matches!(message, PumpMessage::Closed { .. }));
        pump_task.await.unwrap().unwrap();

        match client.receive().await.unwrap() {
            Received::Closed { .. } => {}
            other => panic!("expected close, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn pump_completes_the_closing_handshake_on_a_peer_initiated_close() {
        let (client_io, server_io) = tokio::io::duplex(4096);
        let mut client = DefaultFrameTransport::new(client_io, false);
        let mut server = DefaultFrameTransport::new(server_io, true);

        let (tx, mut rx) = mpsc::channel(8);
        let (_outbound_tx, outbound_rx) = mpsc::channel(1);

        let pump_task = tokio::spawn(async move { run(&mut server, tx, outbound_rx).await });

        client.close(1000, "bye").await.unwrap();
        let message = rx.recv().await.unwrap();
        assert!(matches!(message, PumpMessage::Closed { .. }));
        pump_task.await.unwrap().unwrap();

        match client.receive().await.unwrap() {
            Received::Closed { code, reason } => {
                assert_eq!(code, Some(1000));
                assert_eq!(reason, "Closing");
            }
            other => panic!("expected a normal-closure reply, got {other:?}"),
        }
    }
}

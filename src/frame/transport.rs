//! [`FrameTransport`] is the frame-level collaborator the rest of the crate
//! depends on: given a duplex byte stream, it presents send/receive/close
//! over text and binary messages and exposes an open/closing/closed state.
//! [`DefaultFrameTransport`] is the one in-tree implementation, built on
//! [`super::codec`] and [`tokio_util::codec::Framed`].

use async_trait::async_trait;
use bytes::{Buf, BufMut, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::Framed;

use crate::errors::WsError;

use super::codec::{FrameDecoder, FrameEncoder};
use super::{OpCode, Frame};

/// lifecycle state of a frame transport, mirrors the three states the spec
/// requires the message pump to observe
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    /// open for both send and receive
    Open,
    /// a close frame has been sent or received; draining in progress
    Closing,
    /// fully closed, no further I/O permitted
    Closed,
}

/// one received application message
#[derive(Debug, Clone)]
pub enum Received {
    /// a complete text message
    Text(String),
    /// a complete binary message
    Binary(Vec<u8>),
    /// the peer initiated (or acknowledged) a close
    Closed {
        /// close status code, if the peer sent one
        code: Option<u16>,
        /// close reason, if the peer sent one
        reason: String,
    },
}

/// the frame-level collaborator the core subsystems depend on
#[async_trait]
pub trait FrameTransport: Send {
    /// current lifecycle state
    fn state(&self) -> TransportState;

    /// receive the next complete application message
    async fn receive(&mut self) -> Result<Received, WsError>;

    /// send a text message
    async fn send_text(&mut self, text: &str) -> Result<(), WsError>;

    /// send a binary message
    async fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError>;

    /// send a close frame with the given status code and reason, then mark
    /// the transport closing
    async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError>;
}

/// default, in-tree [`FrameTransport`] over any `AsyncRead + AsyncWrite`
/// stream. Client-originated frames are masked with a freshly generated key
/// per frame; server-originated frames are sent unmasked, per RFC 6455.
pub struct DefaultFrameTransport<S> {
    inner: Framed<S, FrameCodec>,
    is_server: bool,
    state: TransportState,
}

#[derive(Debug, Clone, Default)]
struct FrameCodec {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
}

impl tokio_util::codec::Encoder<Frame> for FrameCodec {
    type Error = std::io::Error;
    fn encode(&mut self, item: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        self.encoder.encode(item, dst)
    }
}

impl tokio_util::codec::Decoder for FrameCodec {
    type Item = Frame;
    type Error = std::io::Error;
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        self.decoder.decode(src)
    }
}

impl<S> DefaultFrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// wrap a stream whose HTTP upgrade handshake has already completed.
    /// `is_server` controls whether outgoing frames are masked (client) or
    /// sent plain (server), per RFC 6455 §5.1.
    pub fn new(stream: S, is_server: bool) -> Self {
        Self {
            inner: Framed::new(stream, FrameCodec::default()),
            is_server,
            state: TransportState::Open,
        }
    }

    fn next_mask() -> [u8; 4] {
        rand::random()
    }

    async fn send_frame(&mut self, opcode: OpCode, data: &[u8]) -> Result<(), WsError> {
        let frame = if self.is_server {
            Frame::new(opcode, data)
        } else {
            Frame::new_masked(opcode, Self::next_mask(), data)
        };
        self.inner
            .send(frame)
            .await
            .map_err(WsError::Io)
    }
}

#[async_trait]
impl<S> FrameTransport for DefaultFrameTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    fn state(&self) -> TransportState {
        self.state
    }

    async fn receive(&mut self) -> Result<Received, WsError> {
        loop {
            if self.state == TransportState::Closed {
                return Err(WsError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    "transport is closed",
                )));
            }
            let frame = match self.inner.next().await {
                Some(frame) => frame.map_err(WsError::Io)?,
                None => {
                    self.state = TransportState::Closed;
                    return Ok(Received::Closed {
                        code: None,
                        reason: String::new(),
                    });
                }
            };
            match frame.opcode() {
                OpCode::Text => {
                    let data = frame.payload();
                    let text = String::from_utf8(data.to_vec()).map_err(|_| {
                        WsError::Io(std::io::Error::new(
                            std::io::ErrorKind::InvalidData,
                            "invalid utf-8 text frame",
                        ))
                    })?;
                    return Ok(Received::Text(text));
                }
                OpCode::Binary => {
                    return Ok(Received::Binary(frame.payload().to_vec()));
                }
                OpCode::Ping => {
                    let payload = frame.payload().to_vec();
                    self.send_frame(OpCode::Pong, &payload).await?;
                    continue;
                }
                OpCode::Pong => continue,
                OpCode::Close => {
                    let mut data = frame.payload();
                    let (code, reason) = if data.len() >= 2 {
                        let code = data.get_u16();
                        (Some(code), String::from_utf8_lossy(&data[..]).to_string())
                    } else {
                        (None, String::new())
                    };
                    if self.state == TransportState::Open {
                        self.state = TransportState::Closing;
                    } else {
                        self.state = TransportState::Closed;
                    }
                    return Ok(Received::Closed { code, reason });
                }
                OpCode::Continue => {
                    // the decoder reassembles fragments; a bare Continue here
                    // indicates a decoder bug rather than peer misbehavior.
                    return Err(WsError::Io(std::io::Error::new(
                        std::io::ErrorKind::InvalidData,
                        "unexpected continuation frame",
                    )));
                }
            }
        }
    }

    async fn send_text(&mut self, text: &str) -> Result<(), WsError> {
        self.send_frame(OpCode::Text, text.as_bytes()).await
    }

    async fn send_binary(&mut self, data: &[u8]) -> Result<(), WsError> {
        self.send_frame(OpCode::Binary, data).await
    }

    async fn close(&mut self, code: u16, reason: &str) -> Result<(), WsError> {
        let mut payload = BytesMut::with_capacity(2 + reason.len());
        payload.put_u16(code);
        payload.extend_from_slice(reason.as_bytes());
        self.send_frame(OpCode::Close, &payload).await?;
        self.state = if self.state == TransportState::Open {
            TransportState::Closing
        } else {
            TransportState::Closed
        };
        Ok(())
    }
}

/// factory used by the upgrade handler to build a transport once the
/// handshake has completed.
pub trait FrameTransportFactory<S>: Send + Sync
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    /// construct a transport bound to `stream`
    fn build(
        &self,
        stream: S,
        is_server: bool,
        subprotocol: Option<String>,
        keepalive: std::time::Duration,
    ) -> Box<dyn FrameTransport>;
}

/// the default factory, producing [`DefaultFrameTransport`]. `keepalive` and
/// `subprotocol` are accepted for interface parity with other factories but
/// are not enforced by the default transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultFrameTransportFactory;

impl<S> FrameTransportFactory<S> for DefaultFrameTransportFactory
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    fn build(
        &self,
        stream: S,
        is_server: bool,
        _subprotocol: Option<String>,
        _keepalive: std::time::Duration,
    ) -> Box<dyn FrameTransport> {
        Box::new(DefaultFrameTransport::new(stream, is_server))
    }
}

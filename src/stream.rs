//! The narrow stream boundary the core depends on instead of a concrete
//! `TcpStream` type, so handshakes and the message pump can run over an
//! in-memory duplex in tests.

use tokio::io::{AsyncRead, AsyncWrite};

/// anything the handshake and frame transport can read from and write to
pub trait AsyncDuplexStream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T> AsyncDuplexStream for T where T: AsyncRead + AsyncWrite + Unpin + Send {}

/// the remote endpoint description a [`crate::session::Session`] records,
/// e.g. for logging or the disconnect event's "peer description".
pub fn describe_peer(addr: Option<std::net::SocketAddr>) -> String {
    match addr {
        Some(addr) => addr.to_string(),
        None => "unknown".to_string(),
    }
}

//! The HTTP/1.1 upgrade handshake: parsing and producing the RFC 6455
//! handshake on both the server and client side.

use std::time::Duration;

use base64::Engine;
use rand::RngCore;
use sha1::{Digest, Sha1};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::context::{Direction, WebContext};
use crate::errors::{UpgradeError, WsError};
use crate::frame::transport::{FrameTransport, FrameTransportFactory};
use crate::stream::AsyncDuplexStream;

/// fixed RFC 6455 GUID appended to the client key before hashing
pub const GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

fn is_valid_path_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_' | '~' | '/')
}

fn base64_encode(data: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(data)
}

fn base64_decode(data: &str) -> Result<Vec<u8>, ()> {
    base64::engine::general_purpose::STANDARD
        .decode(data.as_bytes())
        .map_err(|_| ())
}

/// SHA-1(`key` || [`GUID`]), base64-encoded — the value the server echoes
/// back in `Sec-WebSocket-Accept` and the client re-derives to validate it.
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(GUID.as_bytes());
    base64_encode(&hasher.finalize())
}

fn generate_key() -> String {
    let mut nonce = [0u8; 16];
    rand::thread_rng().fill_bytes(&mut nonce);
    base64_encode(&nonce)
}

fn validate_request_path(path: &str) -> Result<String, UpgradeError> {
    let path = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("/{path}")
    };
    if path[1..].chars().all(is_valid_path_char) {
        Ok(path)
    } else {
        Err(UpgradeError::InvalidPath(path))
    }
}

/// result of negotiating `Sec-WebSocket-Protocol` between client and server
/// lists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NegotiatedProtocol {
    /// neither side named a protocol; omit the header entirely
    None,
    /// the client listed protocols but the server has no preference: echo
    /// the client's entire list back
    EchoClientList(String),
    /// both sides agreed on exactly one protocol
    Accepted(String),
}

/// apply the subprotocol negotiation rule: no lists on either side is fine,
/// a one-sided server preference with no client list is a failure, a client
/// list with no server preference gets echoed back whole, and a server
/// preference against a client list must name one of the client's entries.
pub fn negotiate_subprotocol(
    client_list: &[String],
    server_desired: Option<&str>,
) -> Result<NegotiatedProtocol, UpgradeError> {
    match (client_list.is_empty(), server_desired) {
        (true, None) => Ok(NegotiatedProtocol::None),
        (true, Some(_)) => Err(UpgradeError::SubprotocolNotNegotiated),
        (false, None) => Ok(NegotiatedProtocol::EchoClientList(client_list.join(", "))),
        (false, Some(desired)) => {
            if client_list.iter().any(|c| c.eq_ignore_ascii_case(desired)) {
                Ok(NegotiatedProtocol::Accepted(desired.to_string()))
            } else {
                Err(UpgradeError::SubprotocolNotNegotiated)
            }
        }
    }
}

/// validate an incoming request as a well-formed websocket upgrade,
/// returning the `Sec-WebSocket-Key` value to compute the accept token from.
pub fn validate_upgrade_request(request: &WebContext) -> Result<String, UpgradeError> {
    if !request.is_websocket_request() {
        return Err(UpgradeError::NotAWebSocketRequest);
    }
    match request
        .get_all_values("Sec-WebSocket-Version")
        .into_iter()
        .next()
    {
        Some(v) if v == "13" => {}
        Some(other) => return Err(UpgradeError::UnsupportedVersion(other)),
        None => return Err(UpgradeError::UnsupportedVersion(String::new())),
    }
    let key = request
        .get_all_values("Sec-WebSocket-Key")
        .into_iter()
        .next()
        .ok_or(UpgradeError::InvalidKey)?;
    match base64_decode(&key) {
        Ok(bytes) if bytes.len() == 16 => Ok(key),
        _ => Err(UpgradeError::InvalidKey),
    }
}

impl From<crate::errors::ContextError> for UpgradeError {
    fn from(_: crate::errors::ContextError) -> Self {
        UpgradeError::NotAWebSocketRequest
    }
}

/// read the initial HTTP bytes of a handshake off `stream` into a
/// [`WebContext`], accumulating until the `\r\n\r\n` header terminator.
pub async fn await_context<S: AsyncDuplexStream>(
    stream: &mut S,
    direction: Direction,
    read_buffer_size: usize,
) -> Result<WebContext, WsError> {
    let mut accumulated = Vec::new();
    let mut buf = vec![0u8; read_buffer_size];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            if accumulated.is_empty() {
                return Err(WsError::Upgrade(UpgradeError::StreamClosedDuringHandshake));
            }
            break;
        }
        accumulated.extend_from_slice(&buf[..n]);
        if accumulated.ends_with(b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&accumulated).into_owned();
    WebContext::parse(direction, &text).map_err(|e| WsError::Upgrade(e.into()))
}

/// server-side accept: validate, negotiate, compute the accept token, and
/// write `101 Switching Protocols` to `stream`. Returns the negotiated
/// subprotocol (if any) to pass on to the frame transport factory.
pub async fn accept<S: AsyncDuplexStream>(
    stream: &mut S,
    request: &WebContext,
    response_template: &WebContext,
    confirmed_id: &str,
    desired_subprotocol: Option<&str>,
    send_user_id_to_client: bool,
) -> Result<Option<String>, WsError> {
    let key = validate_upgrade_request(request)?;
    let client_protocols = request.get_all_values("Sec-WebSocket-Protocol");
    let negotiated = negotiate_subprotocol(&client_protocols, desired_subprotocol)?;
    let accept_token = compute_accept_key(&key);

    let mut response = response_template.clone();
    response.set_status(101, "SwitchingProtocols")?;
    response.set_header("Connection", "Upgrade");
    response.set_header("Upgrade", "websocket");
    response.set_header("Sec-WebSocket-Accept", &accept_token);
    let accepted_protocol = match &negotiated {
        NegotiatedProtocol::None => None,
        NegotiatedProtocol::EchoClientList(list) => {
            response.set_header("Sec-WebSocket-Protocol", list);
            None
        }
        NegotiatedProtocol::Accepted(proto) => {
            response.set_header("Sec-WebSocket-Protocol", proto);
            Some(proto.clone())
        }
    };
    if send_user_id_to_client {
        response.set_header("x-user-id", confirmed_id);
    }

    stream.write_all(response.to_wire_string().as_bytes()).await?;
    Ok(accepted_protocol)
}

/// server-side reject: write the response context's status, headers, and
/// body to `stream`. The caller is responsible for then closing the stream.
pub async fn reject<S: AsyncDuplexStream>(
    stream: &mut S,
    response: &WebContext,
) -> Result<(), WsError> {
    stream.write_all(response.to_wire_string().as_bytes()).await?;
    Ok(())
}

/// client-side: validate the request path, generate a key, write the
/// `GET` request line and headers. Returns the generated key so the caller
/// can validate the server's response against it.
pub async fn send_upgrade_request<S: AsyncDuplexStream>(
    stream: &mut S,
    host: &str,
    port: u16,
    path: &str,
    user_id: Option<&str>,
    extra_headers: &[(String, String)],
) -> Result<String, WsError> {
    let path = validate_request_path(path)?;
    let key = generate_key();

    let mut request = WebContext::new_request("GET", &path);
    request.add_header("Host", &format!("{host}:{port}"));
    request.add_header("Upgrade", "websocket");
    request.add_header("Connection", "Upgrade");
    request.add_header("Sec-WebSocket-Version", "13");
    request.add_header("Sec-WebSocket-Key", &key);
    if let Some(user_id) = user_id {
        request.add_header("x-user-id", user_id);
    }
    for (name, value) in extra_headers {
        request.add_header(name, value);
    }

    stream.write_all(request.to_wire_string().as_bytes()).await?;
    Ok(key)
}

/// client-side: validate the server's handshake response against the key
/// that was sent. Returns the `x-user-id` the server echoed back, if any.
pub fn validate_upgrade_response(
    response: &WebContext,
    sent_key: &str,
) -> Result<Option<String>, UpgradeError> {
    match response.status_code() {
        Ok(101) => {}
        Ok(_) | Err(_) => {
            let start = response.to_wire_string();
            return Err(UpgradeError::NotSwitchingProtocols(
                start.lines().next().unwrap_or_default().to_string(),
            ));
        }
    }
    if !response.contains_header("Upgrade", Some("websocket"))
        || !response.contains_header("Connection", Some("upgrade"))
    {
        return Err(UpgradeError::InvalidAcceptToken);
    }
    let expected = compute_accept_key(sent_key);
    let actual = response
        .get_all_values("Sec-WebSocket-Accept")
        .into_iter()
        .next();
    match actual {
        Some(actual) if actual == expected => Ok(response.user_id()),
        _ => Err(UpgradeError::InvalidAcceptToken),
    }
}

/// delegate to the injected factory to build a [`FrameTransport`] bound to
/// `stream`. 30 seconds is the default keepalive passed to the factory.
pub fn create_transport<S, F>(
    factory: &F,
    stream: S,
    is_server: bool,
    subprotocol: Option<String>,
) -> Box<dyn FrameTransport>
where
    S: AsyncDuplexStream + 'static,
    F: FrameTransportFactory<S>,
{
    factory.build(stream, is_server, subprotocol, Duration::from_secs(30))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn negotiation_rule_matrix() {
        assert_eq!(
            negotiate_subprotocol(&[], None).unwrap(),
            NegotiatedProtocol::None
        );
        assert!(negotiate_subprotocol(&[], Some("chat")).is_err());
        assert_eq!(
            negotiate_subprotocol(&["chat".into(), "json".into()], None).unwrap(),
            NegotiatedProtocol::EchoClientList("chat, json".into())
        );
        assert_eq!(
            negotiate_subprotocol(&["chat".into(), "json".into()], Some("JSON")).unwrap(),
            NegotiatedProtocol::Accepted("JSON".into())
        );
        assert!(negotiate_subprotocol(&["chat".into()], Some("binary")).is_err());
    }

    #[test]
    fn accept_key_matches_known_rfc6455_example() {
        assert_eq!(
            compute_accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[tokio::test]
    async fn full_handshake_round_trips_over_a_duplex_stream() {
        let (mut client_io, mut server_io) = tokio::io::duplex(4096);

        let sent_key = send_upgrade_request(
            &mut client_io,
            "example.com",
            9000,
            "/chat",
            Some("user-42"),
            &[],
        )
        .await
        .unwrap();

        let request = await_context(&mut server_io, Direction::Request, 1024)
            .await
            .unwrap();
        assert!(request.is_websocket_request());
        assert_eq!(request.host().unwrap(), "example.com");
        assert_eq!(request.port(), 9000);
        assert_eq!(request.request_path(), "/chat");
        assert_eq!(request.user_id().as_deref(), Some("user-42"));

        let response_template = WebContext::new_response();
        accept(&mut server_io, &request, &response_template, "user-42", None, false)
            .await
            .unwrap();

        let response = await_context(&mut client_io, Direction::Response, 1024)
            .await
            .unwrap();
        let echoed_user_id = validate_upgrade_response(&response, &sent_key).unwrap();
        assert_eq!(echoed_user_id, None);
    }

    #[test]
    fn rejects_invalid_request_path() {
        assert!(validate_request_path("chat room").is_err());
        assert_eq!(validate_request_path("chat").unwrap(), "/chat");
        assert_eq!(validate_request_path("/chat").unwrap(), "/chat");
    }
}

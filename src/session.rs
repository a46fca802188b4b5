//! A [`Session`] is one connected (or recently-disconnected) peer: its
//! identity and the bookkeeping the registry needs to re-identify it across
//! reconnects. The frame transport itself is owned by a dedicated
//! per-connection task (see [`crate::lifecycle`]); a `Session` holds only a
//! channel handle to it, so registry locks are never held across network
//! I/O.

use std::collections::HashMap;

use time::OffsetDateTime;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::errors::{ServerError, WsError};

/// a message handed to the per-connection task to be written out over its
/// frame transport
#[derive(Debug, Clone)]
pub enum Outbound {
    Text(String),
    Binary(Vec<u8>),
    Close(u16, String),
}

/// one connected or recently-disconnected peer tracked by the registry
pub struct Session {
    id: String,
    remote_endpoint: String,
    outbound: Option<mpsc::Sender<Outbound>>,
    first_seen: OffsetDateTime,
    last_seen: OffsetDateTime,
    properties: HashMap<String, String>,
}

impl Session {
    /// start a new session with a freshly generated id, before any
    /// identity has been confirmed over `x-user-id`.
    pub fn new(remote_endpoint: impl Into<String>) -> Self {
        let now = OffsetDateTime::now_utc();
        Self {
            id: Uuid::new_v4().to_string(),
            remote_endpoint: remote_endpoint.into(),
            outbound: None,
            first_seen: now,
            last_seen: now,
            properties: HashMap::new(),
        }
    }

    /// this session's id: either the generated uuid, or the confirmed
    /// `x-user-id` after [`Session::update_id`] has been called
    pub fn id(&self) -> &str {
        &self.id
    }

    /// the peer address recorded at connect time
    pub fn remote_endpoint(&self) -> &str {
        &self.remote_endpoint
    }

    /// when this session was first created
    pub fn first_seen(&self) -> OffsetDateTime {
        self.first_seen
    }

    /// the last time this session's activity was recorded via
    /// [`Session::touch`]
    pub fn last_seen(&self) -> OffsetDateTime {
        self.last_seen
    }

    /// record activity, refreshing `last_seen`
    pub fn touch(&mut self) {
        self.last_seen = OffsetDateTime::now_utc();
    }

    /// replace this session's id with a confirmed `x-user-id`. A non-empty
    /// id is required.
    pub fn update_id(&mut self, confirmed_id: &str) -> Result<(), WsError> {
        if confirmed_id.trim().is_empty() {
            return Err(WsError::Server(ServerError::IdentityConflict));
        }
        self.id = confirmed_id.to_string();
        Ok(())
    }

    /// attach the channel to the per-connection task's frame transport.
    /// Valid exactly once per session.
    pub fn attach_outbound(&mut self, outbound: mpsc::Sender<Outbound>) -> Result<(), WsError> {
        if self.outbound.is_some() {
            return Err(WsError::Server(ServerError::ClientNotConnected));
        }
        self.outbound = Some(outbound);
        Ok(())
    }

    /// a clone of the outbound channel, for sending without holding the
    /// registry lock across the `await`
    pub fn outbound(&self) -> Option<mpsc::Sender<Outbound>> {
        self.outbound.clone()
    }

    /// `true` iff this session has an attached, still-open outbound channel
    pub fn is_connected(&self) -> bool {
        self.outbound.as_ref().is_some_and(|tx| !tx.is_closed())
    }

    /// detach the outbound channel, idempotently
    pub fn disconnect(&mut self) {
        self.outbound = None;
    }

    /// arbitrary key/value metadata attached to this session (e.g. the
    /// negotiated subprotocol)
    pub fn set_property(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.properties.insert(key.into(), value.into());
    }

    /// read back metadata set via [`Session::set_property`]
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }
}

/// a read-only snapshot of a [`Session`], returned by
/// [`crate::server::Server::get_client_by_id`] without exposing the
/// outbound channel itself
#[derive(Debug, Clone)]
pub struct ClientInfo {
    /// the confirmed id this session is tracked under
    pub id: String,
    /// the peer address recorded at connect time
    pub remote_endpoint: String,
    /// when this session was first created
    pub first_seen: OffsetDateTime,
    /// the last time activity was recorded for this session
    pub last_seen: OffsetDateTime,
    /// `true` iff the session has an attached, still-open outbound channel
    pub connected: bool,
}

impl From<&Session> for ClientInfo {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id().to_string(),
            remote_endpoint: session.remote_endpoint().to_string(),
            first_seen: session.first_seen(),
            last_seen: session.last_seen(),
            connected: session.is_connected(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("remote_endpoint", &self.remote_endpoint)
            .field("connected", &self.is_connected())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_session_has_a_generated_uuid_id() {
        let session = Session::new("127.0.0.1:9000");
        assert!(Uuid::parse_str(session.id()).is_ok());
    }

    #[test]
    fn update_id_rejects_blank_ids() {
        let mut session = Session::new("127.0.0.1:9000");
        assert!(session.update_id("   ").is_err());
    }

    #[test]
    fn update_id_replaces_the_generated_id() {
        let mut session = Session::new("127.0.0.1:9000");
        session.update_id("user-42").unwrap();
        assert_eq!(session.id(), "user-42");
    }

    #[test]
    fn properties_round_trip() {
        let mut session = Session::new("127.0.0.1:9000");
        session.set_property("subprotocol", "chat");
        assert_eq!(session.property("subprotocol"), Some("chat"));
        assert_eq!(session.property("missing"), None);
    }

    #[tokio::test]
    async fn attach_outbound_marks_session_connected() {
        let mut session = Session::new("127.0.0.1:9000");
        assert!(!session.is_connected());
        let (tx, _rx) = mpsc::channel(1);
        session.attach_outbound(tx).unwrap();
        assert!(session.is_connected());
    }
}

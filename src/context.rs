//! Parses and emits HTTP/1.1 request/response headers and start-lines over a
//! byte slice. One type services both directions: a context built by reading
//! bytes off the wire, and a context built up field-by-field to be
//! serialized and sent.

use std::collections::BTreeMap;

use crate::errors::ContextError;

/// which half of the handshake a [`WebContext`] represents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// an HTTP request (`METHOD path HTTP/1.1`)
    Request,
    /// an HTTP response (`HTTP/1.1 code reason`)
    Response,
}

/// an HTTP/1.1 message: start-line, ordered headers, and an optional body.
/// Header lookups are case-insensitive; the original casing supplied on
/// insertion is preserved when the context is emitted.
#[derive(Debug, Clone)]
pub struct WebContext {
    direction: Direction,
    start_line: Vec<String>,
    // preserves insertion order of distinct header names; each name can
    // carry multiple raw header lines, matched against case-insensitively.
    headers: Vec<(String, String)>,
    body: Option<String>,
    status_set: bool,
}

impl WebContext {
    /// build an empty request context for `method` and `path`
    pub fn new_request(method: &str, path: &str) -> Self {
        Self {
            direction: Direction::Request,
            start_line: vec![method.to_string(), path.to_string(), "HTTP/1.1".to_string()],
            headers: Vec::new(),
            body: None,
            status_set: false,
        }
    }

    /// build an empty response context; the status must be set exactly once
    /// via [`WebContext::set_status`] before the context can be emitted.
    pub fn new_response() -> Self {
        Self {
            direction: Direction::Response,
            start_line: vec!["HTTP/1.1".to_string()],
            headers: Vec::new(),
            body: None,
            status_set: false,
        }
    }

    /// parse a raw HTTP/1.1 message. Lines are split on `\r\n`, tolerating a
    /// bare `\r` or `\n`; empty lines produced by that split are discarded.
    /// The first non-empty line is the start-line; subsequent lines up to
    /// the blank separator are `Name: value` headers; everything after the
    /// separator is the body.
    pub fn parse(direction: Direction, raw: &str) -> Result<Self, ContextError> {
        let mut lines: Vec<&str> = Vec::new();
        for piece in raw.split("\r\n") {
            for line in piece.split(['\r', '\n']) {
                lines.push(line);
            }
        }

        let mut iter = lines.into_iter();
        let mut start_line: Option<Vec<String>> = None;
        let mut headers = Vec::new();
        let mut body_lines: Vec<&str> = Vec::new();
        let mut in_body = false;

        for line in iter.by_ref() {
            if in_body {
                body_lines.push(line);
                continue;
            }
            if line.is_empty() {
                if start_line.is_some() {
                    in_body = true;
                }
                continue;
            }
            if start_line.is_none() {
                start_line = Some(line.split_whitespace().map(|s| s.to_string()).collect());
                continue;
            }
            match line.split_once(':') {
                Some((name, value)) => headers.push((name.trim().to_string(), value.trim().to_string())),
                None => headers.push((line.trim().to_string(), String::new())),
            }
        }

        let start_line = start_line.ok_or(ContextError::MissingStartLine)?;
        let body = if body_lines.is_empty() {
            None
        } else {
            Some(body_lines.join("\r\n"))
        };

        Ok(Self {
            direction,
            start_line,
            headers,
            body,
            status_set: matches!(direction, Direction::Response),
        })
    }

    /// which direction this context represents
    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// append a header line, preserving the caller's casing on emit
    pub fn add_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    /// replace all existing values for `name` with a single `value`
    pub fn set_header(&mut self, name: &str, value: &str) -> &mut Self {
        self.headers.retain(|(n, _)| !n.eq_ignore_ascii_case(name));
        self.add_header(name, value)
    }

    /// set the body exactly once; a second call is an error
    pub fn set_body(&mut self, body: impl Into<String>) -> Result<(), ContextError> {
        if self.body.is_some() {
            return Err(ContextError::BodyAlreadySet);
        }
        self.body = Some(body.into());
        Ok(())
    }

    /// the body text, empty string if unset
    pub fn body(&self) -> &str {
        self.body.as_deref().unwrap_or("")
    }

    /// set the numeric status and its canonical reason phrase exactly once.
    /// `name` is a PascalCase status name (`NotFound`, `SwitchingProtocols`)
    /// split at upper-case boundaries to build the reason phrase.
    pub fn set_status(&mut self, code: u16, name: &str) -> Result<(), ContextError> {
        if self.status_set {
            return Err(ContextError::StatusAlreadySet);
        }
        self.start_line = vec![
            "HTTP/1.1".to_string(),
            code.to_string(),
            reason_phrase(name),
        ];
        self.status_set = true;
        Ok(())
    }

    /// token 2 of the start-line, parsed as an integer
    pub fn status_code(&self) -> Result<u16, ContextError> {
        let token = self
            .start_line
            .get(1)
            .ok_or(ContextError::MissingStartLine)?;
        token
            .parse()
            .map_err(|_| ContextError::InvalidStatusCode(token.clone()))
    }

    /// token 2 of the start-line (the request path for a request context)
    pub fn request_path(&self) -> &str {
        self.start_line.get(1).map(String::as_str).unwrap_or("")
    }

    /// the request method, token 1 of the start-line
    pub fn method(&self) -> &str {
        self.start_line.first().map(String::as_str).unwrap_or("")
    }

    /// all header lines under `name`, further split on `,` and trimmed
    pub fn get_all_values(&self, name: &str) -> Vec<String> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .flat_map(|(_, v)| v.split(','))
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
            .collect()
    }

    /// `true` when `name` exists and (if `value` given) any of its
    /// comma-expanded values contains `value`, case-insensitive
    pub fn contains_header(&self, name: &str, value: Option<&str>) -> bool {
        let values = self.get_all_values(name);
        match value {
            None => !values.is_empty(),
            Some(needle) => values
                .iter()
                .any(|v| v.to_lowercase().contains(&needle.to_lowercase())),
        }
    }

    /// the first `Host` header's hostname portion, erroring if absent
    pub fn host(&self) -> Result<String, ContextError> {
        let raw = self
            .get_all_values("Host")
            .into_iter()
            .next()
            .ok_or(ContextError::MissingHost)?;
        Ok(match raw.split_once(':') {
            Some((host, _)) => host.to_string(),
            None => raw,
        })
    }

    /// the `Host` header's port, defaulting to 80 when unspecified
    pub fn port(&self) -> u16 {
        self.get_all_values("Host")
            .into_iter()
            .next()
            .and_then(|raw| raw.split_once(':').map(|(_, p)| p.to_string()))
            .and_then(|p| p.parse().ok())
            .unwrap_or(80)
    }

    /// `true` iff `Connection` comma-expands to include `Upgrade`
    /// (case-insensitive) AND `Upgrade` comma-expands to include `websocket`
    pub fn is_websocket_request(&self) -> bool {
        self.contains_header("Connection", Some("upgrade"))
            && self.contains_header("Upgrade", Some("websocket"))
    }

    /// the `x-user-id` header value, if present
    pub fn user_id(&self) -> Option<String> {
        self.get_all_values("x-user-id").into_iter().next()
    }

    /// `true` iff an `x-user-id` header is present
    pub fn contains_user_id(&self) -> bool {
        self.contains_header("x-user-id", None)
    }

    /// serialize this context to the wire representation: start-line,
    /// headers, blank separator, body. A `Content-Length` header is added
    /// when a body is present.
    pub fn to_wire_string(&self) -> String {
        let mut lines = vec![self.start_line.join(" ")];
        // dedupe Content-Length from any caller-supplied value; we compute it.
        let body = self.body();
        let mut emitted_content_length = false;
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            lines.push(format!("{name}: {value}"));
        }
        if !body.is_empty() {
            lines.push(format!("Content-Length: {}", body.len()));
            emitted_content_length = true;
        }
        let _ = emitted_content_length;
        lines.push(String::new());
        lines.push(String::new());
        let mut out = lines.join("\r\n");
        out.push_str(body);
        out
    }

    /// group the raw header lines by case-preserved first-seen name, useful
    /// for diagnostics
    pub fn header_names(&self) -> Vec<String> {
        let mut seen = BTreeMap::new();
        for (name, _) in &self.headers {
            seen.entry(name.to_lowercase()).or_insert_with(|| name.clone());
        }
        seen.into_values().collect()
    }
}

/// split a PascalCase status name at upper-case boundaries: `NotFound` ->
/// `"Not Found"`, `SwitchingProtocols` -> `"Switching Protocols"`.
fn reason_phrase(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    for (i, ch) in name.chars().enumerate() {
        if i > 0 && ch.is_uppercase() {
            out.push(' ');
        }
        out.push(ch);
    }
    out
}

//! Opening Handshake (RFC 6455 section 4.2)
//!
//! Turns the client's HTTP Upgrade request into the `101 Switching Protocols`
//! response. Negotiation is pure: [`negotiate`] maps request bytes to
//! response bytes. [`read_request`] is the one async helper; it buffers a
//! transport until the blank line that ends the request head, bounded by
//! time and size, and hands back any bytes that arrived after it.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use sha1::{Digest, Sha1};
use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

/// Fixed GUID appended to the client key before hashing
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

const REQUEST_TERMINATOR: &[u8] = b"\r\n\r\n";

/// A parsed HTTP Upgrade request head
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub method: String,
    pub path: String,
    pub version: String,
    /// Header (name, value) pairs in arrival order, values trimmed
    pub headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Case-insensitive header lookup; returns the first match
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Request head plus whatever the client sent after the blank line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    pub head: Vec<u8>,
    /// Early frame bytes; they seed the connection's decode buffer
    pub leftover: Vec<u8>,
}

/// Compute `Sec-WebSocket-Accept` for a client key
pub fn accept_key(client_key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(client_key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Offset just past the first `\r\n\r\n`, if the head is complete
pub fn find_request_end(buf: &[u8]) -> Option<usize> {
    find_request_end_from(buf, 0)
}

fn find_request_end_from(buf: &[u8], from: usize) -> Option<usize> {
    buf.get(from..)?
        .windows(REQUEST_TERMINATOR.len())
        .position(|w| w == REQUEST_TERMINATOR)
        .map(|pos| from + pos + REQUEST_TERMINATOR.len())
}

/// Parse the request line and headers
pub fn parse_request(bytes: &[u8]) -> Result<UpgradeRequest, HandshakeError> {
    let text = std::str::from_utf8(bytes)
        .map_err(|_| HandshakeError::Malformed("request is not valid UTF-8".to_string()))?;

    let mut lines = text.lines();
    let request_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| HandshakeError::Malformed("empty request".to_string()))?;

    let mut parts = request_line.split_whitespace();
    let (method, path, version) = match (parts.next(), parts.next(), parts.next(), parts.next()) {
        (Some(method), Some(path), Some(version), None) if version.starts_with("HTTP/") => {
            (method, path, version)
        }
        _ => {
            return Err(HandshakeError::Malformed(format!(
                "invalid request line: {}",
                request_line
            )))
        }
    };

    let mut headers = Vec::new();
    for line in lines {
        if line.is_empty() {
            break;
        }
        let (name, value) = line.split_once(':').ok_or_else(|| {
            HandshakeError::Malformed(format!("invalid header line: {}", line))
        })?;
        headers.push((name.trim().to_string(), value.trim().to_string()));
    }

    Ok(UpgradeRequest {
        method: method.to_string(),
        path: path.to_string(),
        version: version.to_string(),
        headers,
    })
}

/// Build the literal 101 response for an accept value
pub fn accept_response(accept: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Connection: Upgrade\r\n\
         Upgrade: websocket\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept
    )
}

/// Map a complete request head to the bytes of the accept response
///
/// Fails with `MissingKey` when `Sec-WebSocket-Key` is absent or blank; in
/// that case nothing should be written back and the transport dropped.
pub fn negotiate(request: &[u8]) -> Result<Vec<u8>, HandshakeError> {
    let request = parse_request(request)?;

    if !request.method.eq_ignore_ascii_case("GET") {
        return Err(HandshakeError::Malformed(format!(
            "method must be GET, got {}",
            request.method
        )));
    }

    let key = request
        .header("Sec-WebSocket-Key")
        .filter(|key| !key.is_empty())
        .ok_or(HandshakeError::MissingKey)?;

    Ok(accept_response(&accept_key(key)).into_bytes())
}

/// Read a full request head from `reader`
///
/// Waits at most `timeout` for the terminating blank line and gives up once
/// more than `max_bytes` have been buffered without one.
pub async fn read_request<R>(
    reader: &mut R,
    timeout: Duration,
    max_bytes: usize,
) -> Result<RawRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    tokio::time::timeout(timeout, read_until_terminator(reader, max_bytes))
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

async fn read_until_terminator<R>(
    reader: &mut R,
    max_bytes: usize,
) -> Result<RawRequest, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = reader.read(&mut chunk).await.map_err(HandshakeError::Read)?;
        if n == 0 {
            return Err(HandshakeError::Incomplete);
        }

        // The terminator may straddle two reads
        let search_from = buf.len().saturating_sub(REQUEST_TERMINATOR.len() - 1);
        buf.extend_from_slice(&chunk[..n]);

        if let Some(end) = find_request_end_from(&buf, search_from) {
            if end > max_bytes {
                return Err(HandshakeError::RequestTooLarge(max_bytes));
            }
            let leftover = buf.split_off(end);
            return Ok(RawRequest {
                head: buf,
                leftover,
            });
        }

        if buf.len() > max_bytes {
            return Err(HandshakeError::RequestTooLarge(max_bytes));
        }
    }
}

/// Errors that end a connection before it is registered
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("Sec-WebSocket-Key header not found")]
    MissingKey,

    #[error("Malformed upgrade request: {0}")]
    Malformed(String),

    #[error("Handshake not completed within {0:?}")]
    Timeout(Duration),

    #[error("Upgrade request exceeds {0} bytes")]
    RequestTooLarge(usize),

    #[error("Connection closed before the upgrade request was complete")]
    Incomplete,

    #[error("Failed to read upgrade request: {0}")]
    Read(std::io::Error),

    #[error("Failed to write upgrade response: {0}")]
    WriteFailed(std::io::Error),
}

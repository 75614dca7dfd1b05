//! Encode/decode between proxy types and the newline-delimited wire format.
//!
//! Requests and responses travel as one JSON object per line; bodies are
//! base64 inside the JSON so arbitrary bytes round-trip exactly. The
//! CONNECT acknowledgment is the odd one out: a literal HTTP status line
//! followed by a blank line, kept for wire compatibility and parsed only
//! here.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::protocol::{ConnectAck, ProxyRequest, ProxyResponse, MAX_FRAME_SIZE};

/// Serde adapter carrying `Vec<u8>` as a base64 string field
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let text = String::deserialize(deserializer)?;
        STANDARD.decode(text.as_bytes()).map_err(serde::de::Error::custom)
    }
}

pub fn encode_request(request: &ProxyRequest) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(request).map_err(|err| Error::Frame(err.to_string()))?;
    frame.push(b'\n');
    Ok(frame)
}

pub fn decode_request(line: &str) -> Result<ProxyRequest> {
    serde_json::from_str(line).map_err(|err| Error::Frame(err.to_string()))
}

pub fn encode_response(response: &ProxyResponse) -> Result<Vec<u8>> {
    let mut frame = serde_json::to_vec(response).map_err(|err| Error::Frame(err.to_string()))?;
    frame.push(b'\n');
    Ok(frame)
}

pub fn decode_response(line: &str) -> Result<ProxyResponse> {
    serde_json::from_str(line).map_err(|err| Error::Frame(err.to_string()))
}

/// Wire form of a CONNECT acknowledgment: status line + blank line
pub fn encode_connect_ack(ack: &ConnectAck) -> String {
    match ack {
        ConnectAck::Established => "HTTP/1.1 200 Connection Established\r\n\r\n".to_string(),
        ConnectAck::Failed { status } => {
            format!("HTTP/1.1 {} {}\r\n\r\n", status, reason_phrase(*status))
        }
    }
}

/// Parse a CONNECT acknowledgment status line
pub fn parse_connect_ack(line: &str) -> Result<ConnectAck> {
    let line = line.trim_end();
    let mut parts = line.splitn(3, ' ');
    let version = parts
        .next()
        .ok_or_else(|| Error::Frame("empty tunnel acknowledgment".to_string()))?;
    if !version.starts_with("HTTP/") {
        return Err(Error::Frame(format!("not a status line: {line:?}")));
    }
    let status: u16 = parts
        .next()
        .and_then(|code| code.parse().ok())
        .ok_or_else(|| Error::Frame(format!("status line has no code: {line:?}")))?;
    if status == 200 {
        Ok(ConnectAck::Established)
    } else {
        Ok(ConnectAck::Failed { status })
    }
}

/// Read a CONNECT acknowledgment: the status line and its terminating
/// blank line. Bytes past the blank line stay in the reader's buffer and
/// belong to the tunnel.
pub async fn read_connect_ack<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<ConnectAck> {
    let line = read_frame(reader)
        .await?
        .ok_or_else(|| Error::Frame("connection closed before tunnel ack".to_string()))?;
    let ack = parse_connect_ack(&line)?;
    match read_frame(reader).await {
        Ok(Some(blank)) if blank.trim().is_empty() => {}
        Ok(Some(other)) => {
            return Err(Error::Frame(format!(
                "unexpected data after tunnel ack: {other:?}"
            )))
        }
        // Closed right after the status line; the ack already decided.
        Ok(None) | Err(_) => {}
    }
    Ok(ack)
}

/// Read one newline-terminated frame, bounded by [`MAX_FRAME_SIZE`].
///
/// Returns `None` on a clean end-of-stream before any frame bytes.
pub async fn read_frame<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<String>> {
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (found, used) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Err(Error::Frame("connection closed mid-frame".to_string()));
            }
            match available.iter().position(|&b| b == b'\n') {
                Some(pos) => {
                    line.extend_from_slice(&available[..pos]);
                    (true, pos + 1)
                }
                None => {
                    line.extend_from_slice(available);
                    (false, available.len())
                }
            }
        };
        reader.consume(used);
        if line.len() > MAX_FRAME_SIZE {
            return Err(Error::Frame(format!(
                "frame exceeds {MAX_FRAME_SIZE} byte limit"
            )));
        }
        if found {
            let text = String::from_utf8(line)
                .map_err(|_| Error::Frame("frame is not valid UTF-8".to_string()))?;
            return Ok(Some(text));
        }
    }
}

/// Write one encoded frame and flush it onto the wire
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &[u8]) -> Result<()> {
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        204 => "No Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        500 => "Internal Server Error",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        // Peers historically send " OK" for anything unlisted.
        _ => "OK",
    }
}

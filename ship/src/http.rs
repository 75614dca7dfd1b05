//! Client-side HTTP parsing and response writing.
//!
//! The ship speaks plain HTTP/1.1 forward-proxy conventions to its
//! clients: absolute-URI request lines for plain requests, authority
//! form for CONNECT. Responses written back carry only a status line,
//! Content-Length and the body.

use sealink_shared::codec::reason_phrase;
use sealink_shared::protocol::ProxyResponse;
use sealink_shared::{Error, Result};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use url::Url;

/// Upper bound on a request head (start line + headers)
pub const MAX_HEAD_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 64;

/// A parsed client request head
#[derive(Debug)]
pub struct ClientRequest {
    pub method: String,
    pub target: String,
    /// Headers in arrival order, case preserved
    pub headers: Vec<(String, String)>,
    /// Bytes already read past the header section (start of the body,
    /// or of the tunnel stream for CONNECT)
    pub leftover: Vec<u8>,
}

/// Target coordinates of an absolute-URI request line
#[derive(Debug, PartialEq, Eq)]
pub struct HttpTarget {
    pub protocol: String,
    pub hostname: String,
    pub port: u16,
    pub path: String,
}

/// Read and parse one request head off the client stream.
///
/// Returns `None` if the client disconnects before sending anything.
pub async fn read_request_head<R: AsyncRead + Unpin>(
    stream: &mut R,
) -> Result<Option<ClientRequest>> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            if buf.is_empty() {
                return Ok(None);
            }
            return Err(Error::Parse("client closed mid-request".to_string()));
        }
        buf.extend_from_slice(&chunk[..n]);
        if buf.len() > MAX_HEAD_SIZE {
            return Err(Error::Parse("request head too large".to_string()));
        }

        let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut headers);
        match request.parse(&buf) {
            Ok(httparse::Status::Complete(head_len)) => {
                let method = request.method.unwrap_or_default().to_string();
                let target = request.path.unwrap_or_default().to_string();
                let headers = request
                    .headers
                    .iter()
                    .map(|h| {
                        (
                            h.name.to_string(),
                            String::from_utf8_lossy(h.value).into_owned(),
                        )
                    })
                    .collect();
                return Ok(Some(ClientRequest {
                    method,
                    target,
                    headers,
                    leftover: buf[head_len..].to_vec(),
                }));
            }
            Ok(httparse::Status::Partial) => continue,
            Err(err) => return Err(Error::Parse(err.to_string())),
        }
    }
}

/// Parse an absolute-form request target (`http://host:port/path?q`)
pub fn parse_absolute_target(target: &str) -> Result<HttpTarget> {
    let url =
        Url::parse(target).map_err(|err| Error::Parse(format!("invalid request target: {err}")))?;
    let hostname = url
        .host_str()
        .ok_or_else(|| Error::Parse("request target has no host".to_string()))?
        .to_string();
    let port = url
        .port_or_known_default()
        .ok_or_else(|| Error::Parse("request target has no port".to_string()))?;
    let mut path = url.path().to_string();
    if let Some(query) = url.query() {
        path.push('?');
        path.push_str(query);
    }
    if path.is_empty() {
        path = "/".to_string();
    }
    Ok(HttpTarget {
        protocol: url.scheme().to_string(),
        hostname,
        port,
        path,
    })
}

/// Parse an authority-form CONNECT target (`host:port`)
pub fn parse_connect_target(target: &str) -> Result<(String, u16)> {
    let (host, port) = target
        .rsplit_once(':')
        .ok_or_else(|| Error::Parse("CONNECT target must be host:port".to_string()))?;
    if host.is_empty() {
        return Err(Error::Parse("CONNECT target has no host".to_string()));
    }
    let port = port
        .parse()
        .map_err(|_| Error::Parse(format!("invalid CONNECT port: {port:?}")))?;
    Ok((host.to_string(), port))
}

/// Declared body length; zero when absent
pub fn content_length(headers: &[(String, String)]) -> Result<usize> {
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") {
            return value
                .trim()
                .parse()
                .map_err(|_| Error::Parse(format!("invalid Content-Length: {value:?}")));
        }
    }
    Ok(0)
}

/// Read the declared body, starting from bytes buffered past the head
pub async fn read_body<R: AsyncRead + Unpin>(
    stream: &mut R,
    leftover: Vec<u8>,
    length: usize,
) -> Result<Vec<u8>> {
    let mut body = leftover;
    // Anything past the declared length would be pipelining; drop it.
    body.truncate(length.min(body.len()));
    while body.len() < length {
        let mut chunk = vec![0u8; (length - body.len()).min(8192)];
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::Parse(
                "client closed before sending the full body".to_string(),
            ));
        }
        body.extend_from_slice(&chunk[..n]);
    }
    Ok(body)
}

/// Write an offshore response back to the client: status line,
/// Content-Length, then the decoded body. Offshore headers are not
/// replayed.
pub async fn write_response<W: AsyncWrite + Unpin>(
    stream: &mut W,
    response: &ProxyResponse,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: {}\r\n\r\n",
        response.status_code,
        reason_phrase(response.status_code),
        response.body.len()
    );
    stream.write_all(head.as_bytes()).await?;
    stream.write_all(&response.body).await?;
    stream.flush().await
}

/// Write an empty-body failure status to the client
pub async fn write_error<W: AsyncWrite + Unpin>(
    stream: &mut W,
    status: u16,
) -> std::io::Result<()> {
    let head = format!(
        "HTTP/1.1 {} {}\r\nContent-Length: 0\r\n\r\n",
        status,
        reason_phrase(status)
    );
    stream.write_all(head.as_bytes()).await?;
    stream.flush().await
}

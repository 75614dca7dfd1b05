//! The single persistent ship↔offshore connection.
//!
//! All non-CONNECT traffic shares this one socket, strictly one request
//! at a time. Only the serializer worker ever touches it.

use std::time::Duration;

use sealink_shared::protocol::{ProxyRequest, ProxyResponse, CONNECT_ACK_TIMEOUT};
use sealink_shared::{codec, Error, Result};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::time::sleep;
use tracing::{info, warn};

/// Offshore link settings
#[derive(Debug, Clone)]
pub struct UplinkConfig {
    /// Offshore proxy address (`host:port`)
    pub addr: String,
    /// Connect attempts before the link is declared unavailable
    pub connect_attempts: u32,
    /// Fixed delay between connect attempts
    pub retry_delay: Duration,
    /// Bound on a CONNECT negotiation (connect + ack)
    pub ack_timeout: Duration,
}

impl UplinkConfig {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            connect_attempts: 10,
            retry_delay: Duration::from_secs(2),
            ack_timeout: CONNECT_ACK_TIMEOUT,
        }
    }
}

/// The established persistent connection
pub struct Uplink {
    reader: BufReader<OwnedReadHalf>,
    writer: OwnedWriteHalf,
}

impl Uplink {
    /// Connect with bounded retry and fixed backoff
    pub async fn connect(config: &UplinkConfig) -> Result<Self> {
        let mut attempt = 0u32;
        loop {
            match TcpStream::connect(&config.addr).await {
                Ok(stream) => {
                    info!("Connected to offshore proxy at {}", config.addr);
                    let (read_half, write_half) = stream.into_split();
                    return Ok(Self {
                        reader: BufReader::new(read_half),
                        writer: write_half,
                    });
                }
                Err(err) => {
                    attempt += 1;
                    if attempt >= config.connect_attempts {
                        return Err(Error::Uplink(format!(
                            "failed to reach {} after {} attempts: {}",
                            config.addr, attempt, err
                        )));
                    }
                    warn!(
                        "Waiting for offshore proxy at {} (attempt {}/{})",
                        config.addr, attempt, config.connect_attempts
                    );
                    sleep(config.retry_delay).await;
                }
            }
        }
    }

    /// Write one encoded request, then block reading exactly one encoded
    /// response. This read-after-write discipline is what keeps at most
    /// one request in flight on the link.
    pub async fn round_trip(&mut self, request: &ProxyRequest) -> Result<ProxyResponse> {
        let frame = codec::encode_request(request)?;
        codec::write_frame(&mut self.writer, &frame).await?;
        let line = codec::read_frame(&mut self.reader)
            .await?
            .ok_or_else(|| Error::Uplink("offshore closed the persistent connection".to_string()))?;
        codec::decode_response(&line)
    }
}

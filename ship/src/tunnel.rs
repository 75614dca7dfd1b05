//! CONNECT tunnel negotiation and the client↔offshore data relay.

use std::sync::Arc;

use sealink_shared::protocol::ProxyRequest;
use sealink_shared::{relay, Error, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::http;
use crate::serializer::{Completion, Serializer};

/// Negotiates tunnels through the shared serializer and runs their data
/// phase.
///
/// `connect_gate` is the process-wide CONNECT critical section: it spans
/// submit + acknowledgment only. Established tunnels relay concurrently
/// with each other and with everything else.
#[derive(Clone)]
pub struct TunnelManager {
    serializer: Serializer,
    connect_gate: Arc<Mutex<()>>,
}

impl TunnelManager {
    pub fn new(serializer: Serializer) -> Self {
        Self {
            serializer,
            connect_gate: Arc::new(Mutex::new(())),
        }
    }

    /// Establish a tunnel to `hostname:port` for a CONNECT client and
    /// relay until both directions finish. `leftover` is whatever the
    /// client already sent past its request head; it is forwarded into
    /// the tunnel first.
    ///
    /// All client signaling (200 / 502 / 504) happens here.
    pub async fn run(
        &self,
        mut client: TcpStream,
        hostname: String,
        port: u16,
        leftover: Vec<u8>,
    ) -> Result<()> {
        let target = format!("{hostname}:{port}");
        let completion = {
            let _gate = self.connect_gate.lock().await;
            self.serializer
                .submit(ProxyRequest::connect(hostname, port))
                .await
        };

        let mut tunnel = match completion {
            Ok(Completion::Tunnel(tunnel)) => tunnel,
            Ok(Completion::Response(_)) => {
                http::write_error(&mut client, 502).await.ok();
                return Err(Error::Uplink(
                    "CONNECT completed without a tunnel".to_string(),
                ));
            }
            Err(Error::TunnelTimeout) => {
                warn!("Tunnel to {} timed out", target);
                http::write_error(&mut client, 504).await.ok();
                return Err(Error::TunnelTimeout);
            }
            Err(err) => {
                warn!("Tunnel to {} failed: {}", target, err);
                http::write_error(&mut client, 502).await.ok();
                return Err(err);
            }
        };

        client
            .write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        if !leftover.is_empty() {
            tunnel.writer.write_all(&leftover).await?;
        }

        let (client_read, client_write) = client.into_split();
        let (sent, received) =
            relay::splice(client_read, client_write, tunnel.reader, tunnel.writer).await;
        debug!(
            "Tunnel to {} closed ({} bytes sent, {} received)",
            target, sent, received
        );
        Ok(())
    }
}

//! Decodes inbound wire frames and dispatches them: real HTTP fetches
//! for plain requests, raw tunnels for CONNECT.
//!
//! Every inbound connection looks the same until its first frame: the
//! persistent uplink keeps sending plain requests on one connection,
//! while each CONNECT arrives on a connection of its own that the
//! tunnel then consumes entirely.

use std::collections::BTreeMap;

use sealink_shared::protocol::{ConnectAck, ProxyRequest, ProxyResponse};
use sealink_shared::{codec, relay, Error, Result};
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use crate::fetch::Fetcher;

/// Serve one ship connection until it closes or turns into a tunnel
pub async fn handle_connection(stream: TcpStream, fetcher: Fetcher) -> Result<()> {
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    loop {
        let line = match codec::read_frame(&mut reader).await? {
            Some(line) => line,
            None => {
                debug!("Ship connection closed");
                return Ok(());
            }
        };
        let request = codec::decode_request(&line)?;

        if request.is_connect() {
            return serve_tunnel(request, reader, writer).await;
        }

        let response = match fetcher.execute(&request).await {
            Ok(response) => response,
            Err(err) => {
                warn!("{} {} failed: {}", request.method, request.target_url(), err);
                bad_gateway(&err)
            }
        };
        info!(
            "{} {} -> {}",
            request.method,
            request.target_url(),
            response.status_code
        );
        let frame = codec::encode_response(&response)?;
        codec::write_frame(&mut writer, &frame).await?;
    }
}

fn bad_gateway(err: &Error) -> ProxyResponse {
    ProxyResponse {
        status_code: 502,
        headers: BTreeMap::new(),
        body: err.to_string().into_bytes(),
    }
}

/// Open the target, acknowledge with a status line, then splice the ship
/// connection and the target until both directions finish.
async fn serve_tunnel(
    request: ProxyRequest,
    reader: BufReader<OwnedReadHalf>,
    mut writer: OwnedWriteHalf,
) -> Result<()> {
    let target_addr = format!("{}:{}", request.hostname, request.port);
    let target = match TcpStream::connect(&target_addr).await {
        Ok(target) => target,
        Err(err) => {
            warn!("Cannot open tunnel to {}: {}", target_addr, err);
            let ack = codec::encode_connect_ack(&ConnectAck::Failed { status: 502 });
            writer.write_all(ack.as_bytes()).await?;
            writer.flush().await?;
            return Ok(());
        }
    };

    let ack = codec::encode_connect_ack(&ConnectAck::Established);
    writer.write_all(ack.as_bytes()).await?;
    writer.flush().await?;
    info!("Tunnel open to {}", target_addr);

    let (target_read, target_write) = target.into_split();
    let (sent, received) = relay::splice(reader, writer, target_read, target_write).await;
    debug!(
        "Tunnel to {} closed ({} bytes out, {} back)",
        target_addr, sent, received
    );
    Ok(())
}

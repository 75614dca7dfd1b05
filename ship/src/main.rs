use std::collections::BTreeMap;

use anyhow::{Context, Result};
use clap::Parser;
use sealink_shared::protocol::{ProxyRequest, METHOD_CONNECT};
use sealink_shared::Error;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

mod http;
mod serializer;
mod tunnel;
mod uplink;

use serializer::{Completion, Serializer};
use tunnel::TunnelManager;
use uplink::UplinkConfig;

#[derive(Parser)]
#[command(name = "sealink-ship")]
#[command(version = "0.1.0")]
#[command(about = "Ship-side proxy: one serialized link to shore", long_about = None)]
struct Cli {
    /// Address to accept client proxy connections on
    #[arg(short, long, default_value = "0.0.0.0:8080")]
    listen: String,

    /// Offshore proxy address
    #[arg(short, long, default_value = "offshore-proxy:9000")]
    offshore: String,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(tracing::Level::INFO)
            .init();
    }

    let serializer = Serializer::spawn(UplinkConfig::new(cli.offshore.clone()));
    let tunnels = TunnelManager::new(serializer.clone());

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Ship proxy listening on {} (offshore: {})", cli.listen, cli.offshore);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let serializer = serializer.clone();
                        let tunnels = tunnels.clone();
                        tokio::spawn(async move {
                            if let Err(err) = handle_client(stream, serializer, tunnels).await {
                                debug!("Client {} closed with error: {}", peer, err);
                            }
                        });
                    }
                    Err(err) => error!("Accept failed: {}", err),
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down...");
                break;
            }
        }
    }

    Ok(())
}

/// Serve one client connection: parse the request, push it through the
/// serializer (or hand CONNECT off to the tunnel manager), answer, close.
async fn handle_client(
    mut stream: TcpStream,
    serializer: Serializer,
    tunnels: TunnelManager,
) -> sealink_shared::Result<()> {
    let head = match http::read_request_head(&mut stream).await {
        Ok(Some(head)) => head,
        Ok(None) => return Ok(()),
        Err(err) => {
            http::write_error(&mut stream, 400).await.ok();
            return Err(err);
        }
    };

    if head.method.eq_ignore_ascii_case(METHOD_CONNECT) {
        let (hostname, port) = match http::parse_connect_target(&head.target) {
            Ok(target) => target,
            Err(err) => {
                http::write_error(&mut stream, 400).await.ok();
                return Err(err);
            }
        };
        return tunnels.run(stream, hostname, port, head.leftover).await;
    }

    let target = match http::parse_absolute_target(&head.target) {
        Ok(target) => target,
        Err(err) => {
            http::write_error(&mut stream, 400).await.ok();
            return Err(err);
        }
    };
    let length = match http::content_length(&head.headers) {
        Ok(length) => length,
        Err(err) => {
            http::write_error(&mut stream, 400).await.ok();
            return Err(err);
        }
    };
    let body = http::read_body(&mut stream, head.leftover, length).await?;

    // Duplicate header names collapse to the last value seen.
    let mut headers = BTreeMap::new();
    for (name, value) in head.headers {
        headers.insert(name, value);
    }

    let request = ProxyRequest {
        method: head.method,
        protocol: target.protocol,
        hostname: target.hostname,
        port: target.port,
        path: target.path,
        headers,
        body,
    };

    match serializer.submit(request).await {
        Ok(Completion::Response(response)) => {
            http::write_response(&mut stream, &response).await?;
            Ok(())
        }
        Ok(Completion::Tunnel(_)) => {
            http::write_error(&mut stream, 502).await.ok();
            Err(Error::Uplink("plain request completed as a tunnel".to_string()))
        }
        Err(err) => {
            warn!("Request failed: {}", err);
            http::write_error(&mut stream, 502).await.ok();
            Err(err)
        }
    }
}

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{debug, error, info};

mod dispatcher;
mod fetch;

use fetch::Fetcher;

#[derive(Parser)]
#[command(name = "sealink-offshore")]
#[command(version = "0.1.0")]
#[command(about = "Offshore-side proxy: real egress for ship traffic", long_about = None)]
struct Cli {
    /// Address to accept ship connections on
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    listen: String,

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

    let fetcher = Fetcher::new().context("Failed to build the outbound HTTP client")?;

    let listener = TcpListener::bind(&cli.listen)
        .await
        .with_context(|| format!("Failed to bind {}", cli.listen))?;
    info!("Offshore proxy listening on {}", cli.listen);

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        info!("Ship connected from {}", peer);
                        let fetcher = fetcher.clone();
                        tokio::spawn(async move {
                            if let Err(err) = dispatcher::handle_connection(stream, fetcher).await {
                                debug!("Connection from {} ended with error: {}", peer, err);
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

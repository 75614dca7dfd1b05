//! FIFO request serializer: many concurrent clients in, one link out.
//!
//! Submissions land on an unbounded queue drained by a single worker
//! task in strict arrival order. Plain requests ride the persistent
//! uplink one at a time; CONNECT entries get a fresh offshore connection
//! negotiated inline, so the queue advances as soon as the tunnel is
//! acknowledged and the data phase never blocks it.

use sealink_shared::protocol::{ConnectAck, ProxyRequest, ProxyResponse};
use sealink_shared::{codec, Error, Result};
use tokio::io::BufReader;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, error, warn};

use crate::uplink::{Uplink, UplinkConfig};

/// Dedicated offshore connection attached to an established tunnel.
///
/// The buffered read half preserves any target bytes that arrived right
/// behind the acknowledgment.
pub struct TunnelStream {
    pub reader: BufReader<OwnedReadHalf>,
    pub writer: OwnedWriteHalf,
}

/// What a submission resolves to
pub enum Completion {
    Response(ProxyResponse),
    Tunnel(TunnelStream),
}

struct PendingRequest {
    request: ProxyRequest,
    // Consumed by send: the completion slot is written exactly once.
    reply: oneshot::Sender<Result<Completion>>,
}

/// Cloneable handle feeding the worker's queue
#[derive(Clone)]
pub struct Serializer {
    tx: mpsc::UnboundedSender<PendingRequest>,
}

impl Serializer {
    /// Start the worker task and return a handle to its queue
    pub fn spawn(config: UplinkConfig) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(worker(config, rx));
        Self { tx }
    }

    /// Enqueue one request and wait for its completion.
    ///
    /// Dropping the returned future abandons the request; the worker
    /// discards its completion, closing any attached tunnel connection.
    pub async fn submit(&self, request: ProxyRequest) -> Result<Completion> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(PendingRequest { request, reply })
            .map_err(|_| Error::Uplink("request worker is gone".to_string()))?;
        rx.await
            .map_err(|_| Error::Uplink("request worker dropped the request".to_string()))?
    }
}

async fn worker(config: UplinkConfig, mut rx: mpsc::UnboundedReceiver<PendingRequest>) {
    let mut uplink = match Uplink::connect(&config).await {
        Ok(uplink) => uplink,
        Err(err) => {
            error!("{}", err);
            fail_all(&mut rx, &err.to_string()).await;
            return;
        }
    };

    while let Some(pending) = rx.recv().await {
        if pending.request.is_connect() {
            negotiate_tunnel(&config, pending).await;
            continue;
        }
        match uplink.round_trip(&pending.request).await {
            Ok(response) => {
                let _ = pending.reply.send(Ok(Completion::Response(response)));
            }
            Err(err) => {
                let msg = err.to_string();
                error!("Persistent uplink failed: {}", msg);
                let _ = pending.reply.send(Err(Error::Uplink(msg.clone())));
                fail_all(&mut rx, &msg).await;
                return;
            }
        }
    }
}

/// The uplink is gone for good: answer every queued and future
/// submission immediately instead of letting callers hang.
async fn fail_all(rx: &mut mpsc::UnboundedReceiver<PendingRequest>, msg: &str) {
    while let Some(pending) = rx.recv().await {
        let _ = pending.reply.send(Err(Error::Uplink(msg.to_string())));
    }
}

/// Open a fresh offshore connection for a CONNECT entry and wait for the
/// acknowledgment, all bounded by the ack timeout. The queue moves on as
/// soon as this resolves; the data phase belongs to the tunnel manager.
async fn negotiate_tunnel(config: &UplinkConfig, pending: PendingRequest) {
    let target = format!("{}:{}", pending.request.hostname, pending.request.port);
    let outcome = match timeout(config.ack_timeout, open_tunnel(config, &pending.request)).await {
        Ok(Ok(stream)) => {
            debug!("Tunnel to {} established", target);
            Ok(Completion::Tunnel(stream))
        }
        Ok(Err(err)) => {
            warn!("Tunnel to {} failed: {}", target, err);
            Err(err)
        }
        Err(_) => {
            warn!("Tunnel to {} timed out awaiting acknowledgment", target);
            Err(Error::TunnelTimeout)
        }
    };
    // A dropped caller just makes this send fail; dropping the outcome
    // closes the tunnel socket with it.
    let _ = pending.reply.send(outcome);
}

async fn open_tunnel(config: &UplinkConfig, request: &ProxyRequest) -> Result<TunnelStream> {
    let stream = TcpStream::connect(&config.addr)
        .await
        .map_err(|err| Error::Uplink(format!("cannot reach offshore at {}: {}", config.addr, err)))?;
    let (read_half, write_half) = stream.into_split();
    let mut reader = BufReader::new(read_half);
    let mut writer = write_half;

    let frame = codec::encode_request(request)?;
    codec::write_frame(&mut writer, &frame).await?;
    match codec::read_connect_ack(&mut reader).await? {
        ConnectAck::Established => Ok(TunnelStream { reader, writer }),
        ConnectAck::Failed { status } => Err(Error::TunnelRejected(status)),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use sealink_shared::protocol::ProxyResponse;
    use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::time::sleep;

    use super::*;

    fn test_config(addr: String) -> UplinkConfig {
        UplinkConfig {
            addr,
            connect_attempts: 2,
            retry_delay: Duration::from_millis(5),
            ack_timeout: Duration::from_millis(200),
        }
    }

    fn plain_request(path: &str) -> ProxyRequest {
        ProxyRequest {
            method: "GET".to_string(),
            protocol: "http".to_string(),
            hostname: "example.com".to_string(),
            port: 80,
            path: path.to_string(),
            headers: BTreeMap::new(),
            body: Vec::new(),
        }
    }

    async fn echo_response(
        writer: &mut OwnedWriteHalf,
        path: String,
    ) -> std::io::Result<()> {
        let response = ProxyResponse {
            status_code: 200,
            headers: BTreeMap::new(),
            body: path.into_bytes(),
        };
        let frame = codec::encode_response(&response).unwrap();
        writer.write_all(&frame).await
    }

    #[tokio::test]
    async fn round_trips_are_correlated_and_single_flight() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // One persistent connection; echoes the requested path as the
        // body and asserts no second request is pipelined behind an
        // unanswered one.
        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut served = 0usize;
            while let Some(line) = codec::read_frame(&mut reader).await.unwrap() {
                let request = codec::decode_request(&line).unwrap();
                match timeout(Duration::from_millis(10), reader.fill_buf()).await {
                    Err(_) => {}
                    Ok(Ok(buf)) => assert!(buf.is_empty(), "request pipelined behind another"),
                    Ok(Err(err)) => panic!("mock read failed: {err}"),
                }
                echo_response(&mut writer, request.path).await.unwrap();
                served += 1;
            }
            served
        });

        let serializer = Serializer::spawn(test_config(addr));
        let mut submitters = Vec::new();
        for i in 0..8 {
            let serializer = serializer.clone();
            submitters.push(tokio::spawn(async move {
                let path = format!("/req/{i}");
                match serializer.submit(plain_request(&path)).await.unwrap() {
                    Completion::Response(response) => {
                        assert_eq!(response.status_code, 200);
                        assert_eq!(response.body, path.into_bytes());
                    }
                    Completion::Tunnel(_) => panic!("plain request completed as tunnel"),
                }
            }));
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }

        // Dropping the last handle ends the worker, which closes the
        // uplink and lets the mock finish.
        drop(serializer);
        let served = timeout(Duration::from_secs(2), mock).await.unwrap().unwrap();
        assert_eq!(served, 8);
    }

    #[tokio::test]
    async fn queue_preserves_submission_order() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        let mock = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let mut order = Vec::new();
            while let Some(line) = codec::read_frame(&mut reader).await.unwrap() {
                let request = codec::decode_request(&line).unwrap();
                order.push(request.path.clone());
                echo_response(&mut writer, request.path).await.unwrap();
            }
            order
        });

        let serializer = Serializer::spawn(test_config(addr));
        let mut submitters = Vec::new();
        for i in 0..4 {
            let serializer = serializer.clone();
            submitters.push(tokio::spawn(async move {
                serializer.submit(plain_request(&format!("/{i}"))).await.unwrap();
            }));
            // Space the spawns out so enqueue order is the spawn order.
            sleep(Duration::from_millis(20)).await;
        }
        for submitter in submitters {
            submitter.await.unwrap();
        }
        drop(serializer);

        let order = timeout(Duration::from_secs(2), mock).await.unwrap().unwrap();
        assert_eq!(order, vec!["/0", "/1", "/2", "/3"]);
    }

    #[tokio::test]
    async fn unreachable_offshore_fails_submissions_fast() {
        let serializer = Serializer::spawn(test_config("127.0.0.1:1".to_string()));
        for _ in 0..2 {
            let result = timeout(
                Duration::from_secs(2),
                serializer.submit(plain_request("/")),
            )
            .await
            .expect("submission must fail, not hang");
            assert!(matches!(result, Err(Error::Uplink(_))));
        }
    }

    #[tokio::test]
    async fn uplink_death_fails_later_submissions() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        // Accept the uplink, read one frame, drop the connection.
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, _writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = codec::read_frame(&mut reader).await;
        });

        let serializer = Serializer::spawn(test_config(addr));
        let first = serializer.submit(plain_request("/a")).await;
        assert!(matches!(first, Err(Error::Uplink(_))));

        let second = timeout(
            Duration::from_secs(1),
            serializer.submit(plain_request("/b")),
        )
        .await
        .expect("dead uplink must fail fast");
        assert!(matches!(second, Err(Error::Uplink(_))));
    }

    #[tokio::test]
    async fn connect_attaches_a_dedicated_tunnel() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            // First connection is the persistent uplink; it stays idle.
            let (_uplink, _) = listener.accept().await.unwrap();
            // Second is the dedicated tunnel connection.
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let line = codec::read_frame(&mut reader).await.unwrap().unwrap();
            let request = codec::decode_request(&line).unwrap();
            assert!(request.is_connect());
            assert_eq!(request.hostname, "secure.example.com");
            assert_eq!(request.port, 443);

            // Ack and first target bytes in a single write: the ship
            // must not lose what is buffered behind the status line.
            let mut opening = codec::encode_connect_ack(&ConnectAck::Established).into_bytes();
            opening.extend_from_slice(b"banner");
            writer.write_all(&opening).await.unwrap();

            let mut buf = vec![0u8; 4];
            reader.read_exact(&mut buf).await.unwrap();
            writer.write_all(&buf).await.unwrap();
        });

        let serializer = Serializer::spawn(test_config(addr));
        let completion = serializer
            .submit(ProxyRequest::connect("secure.example.com", 443))
            .await
            .unwrap();
        let mut tunnel = match completion {
            Completion::Tunnel(tunnel) => tunnel,
            Completion::Response(_) => panic!("CONNECT completed as a plain response"),
        };

        let mut banner = vec![0u8; 6];
        tunnel.reader.read_exact(&mut banner).await.unwrap();
        assert_eq!(&banner, b"banner");

        tunnel.writer.write_all(b"ping").await.unwrap();
        let mut echoed = vec![0u8; 4];
        tunnel.reader.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");
    }

    #[tokio::test]
    async fn rejected_connect_reports_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (_uplink, _) = listener.accept().await.unwrap();
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            let _ = codec::read_frame(&mut reader).await;
            let ack = codec::encode_connect_ack(&ConnectAck::Failed { status: 502 });
            writer.write_all(ack.as_bytes()).await.unwrap();
        });

        let serializer = Serializer::spawn(test_config(addr));
        let result = serializer
            .submit(ProxyRequest::connect("unreachable.example.com", 443))
            .await;
        assert!(matches!(result, Err(Error::TunnelRejected(502))));
    }

    #[tokio::test]
    async fn connect_ack_timeout_releases_the_queue() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (uplink, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = uplink.into_split();
            let mut reader = BufReader::new(read_half);

            // The tunnel connection arrives first in queue order; hold
            // it open without ever acknowledging.
            let (silent, _) = listener.accept().await.unwrap();

            // Serve the plain request queued behind the CONNECT.
            let line = codec::read_frame(&mut reader).await.unwrap().unwrap();
            let request = codec::decode_request(&line).unwrap();
            echo_response(&mut writer, request.path).await.unwrap();

            sleep(Duration::from_secs(1)).await;
            drop(silent);
        });

        let serializer = Serializer::spawn(test_config(addr));
        let connect = {
            let serializer = serializer.clone();
            tokio::spawn(async move {
                serializer
                    .submit(ProxyRequest::connect("slow.example.com", 443))
                    .await
            })
        };
        sleep(Duration::from_millis(20)).await;
        let plain = {
            let serializer = serializer.clone();
            tokio::spawn(async move { serializer.submit(plain_request("/after")).await })
        };

        let connect = connect.await.unwrap();
        assert!(matches!(connect, Err(Error::TunnelTimeout)));

        // The timed-out negotiation must not wedge the queue.
        let plain = timeout(Duration::from_secs(2), plain)
            .await
            .expect("queued request must proceed after the timeout")
            .unwrap()
            .unwrap();
        match plain {
            Completion::Response(response) => assert_eq!(response.body, b"/after"),
            Completion::Tunnel(_) => panic!("plain request completed as tunnel"),
        }
    }

    #[tokio::test]
    async fn abandoned_caller_does_not_wedge_the_worker() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let (read_half, mut writer) = stream.into_split();
            let mut reader = BufReader::new(read_half);
            while let Some(line) = codec::read_frame(&mut reader).await.unwrap() {
                let request = codec::decode_request(&line).unwrap();
                // Slow enough for the first caller to give up.
                sleep(Duration::from_millis(80)).await;
                echo_response(&mut writer, request.path).await.unwrap();
            }
        });

        let serializer = Serializer::spawn(test_config(addr));
        let abandoned = {
            let serializer = serializer.clone();
            tokio::spawn(async move { serializer.submit(plain_request("/gone")).await })
        };
        sleep(Duration::from_millis(20)).await;
        abandoned.abort();

        let completion = timeout(
            Duration::from_secs(2),
            serializer.submit(plain_request("/still-works")),
        )
        .await
        .expect("worker must survive an abandoned caller")
        .unwrap();
        match completion {
            Completion::Response(response) => assert_eq!(response.body, b"/still-works"),
            Completion::Tunnel(_) => panic!("plain request completed as tunnel"),
        }
    }
}

//! Bidirectional byte relay between two stream endpoints.

use tokio::io::{copy, AsyncRead, AsyncWrite, AsyncWriteExt};
use tracing::debug;

/// Relay bytes a→b and b→a concurrently until both directions finish.
///
/// Each direction runs until its source hits end-of-stream or errors;
/// either way the destination's write side is shut down so the half-close
/// propagates, and the other direction keeps going on its own. I/O errors
/// mid-relay count as end-of-stream, not failures. Returns the byte
/// counts (a→b, b→a); the caller drops the endpoints, closing both
/// connections.
pub async fn splice<AR, AW, BR, BW>(
    mut a_reader: AR,
    mut a_writer: AW,
    mut b_reader: BR,
    mut b_writer: BW,
) -> (u64, u64)
where
    AR: AsyncRead + Unpin,
    AW: AsyncWrite + Unpin,
    BR: AsyncRead + Unpin,
    BW: AsyncWrite + Unpin,
{
    let (a_to_b, b_to_a) = tokio::join!(
        async {
            let copied = copy(&mut a_reader, &mut b_writer).await;
            b_writer.shutdown().await.ok();
            copied
        },
        async {
            let copied = copy(&mut b_reader, &mut a_writer).await;
            a_writer.shutdown().await.ok();
            copied
        }
    );
    let a_to_b = a_to_b.unwrap_or_else(|err| {
        debug!("relay a->b ended with error: {}", err);
        0
    });
    let b_to_a = b_to_a.unwrap_or_else(|err| {
        debug!("relay b->a ended with error: {}", err);
        0
    });
    (a_to_b, b_to_a)
}

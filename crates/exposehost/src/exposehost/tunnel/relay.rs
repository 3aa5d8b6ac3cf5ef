use tokio::io::{AsyncRead, AsyncWrite};

use crate::exposehost::tunnel::error::TunnelError;

pub const RELAY_CHUNK: usize = 4096;

/// Relays bytes both ways between `a` and `b` in chunks of at most [`RELAY_CHUNK`]
/// bytes until both directions reach EOF. Each direction shuts down the write side
/// of its destination on EOF.
///
/// Returns `(a_to_b, b_to_a)` byte counts.
pub async fn relay<A, B>(mut a: A, mut b: B) -> Result<(u64, u64), TunnelError>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    tokio::io::copy_bidirectional_with_sizes(&mut a, &mut b, RELAY_CHUNK, RELAY_CHUNK)
        .await
        .map_err(TunnelError::RelayIo)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn relays_both_ways_and_propagates_eof() {
        let (mut left, a) = tokio::io::duplex(64);
        let (b, mut right) = tokio::io::duplex(64);

        let task = tokio::spawn(relay(a, b));

        left.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        right.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        right.write_all(b"pong!").await.unwrap();
        let mut buf = [0u8; 5];
        left.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong!");

        // Half-close from the left reaches the right as EOF.
        left.shutdown().await.unwrap();
        let mut rest = Vec::new();
        right.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());

        right.shutdown().await.unwrap();
        let (ab, ba) = task.await.unwrap().unwrap();
        assert_eq!((ab, ba), (4, 5));
    }

    #[tokio::test]
    async fn large_transfer_is_chunked_intact() {
        let (mut left, a) = tokio::io::duplex(RELAY_CHUNK);
        let (b, mut right) = tokio::io::duplex(RELAY_CHUNK);
        let task = tokio::spawn(relay(a, b));

        let data: Vec<u8> = (0..RELAY_CHUNK * 5 + 17).map(|i| (i % 251) as u8).collect();
        let expected = data.clone();
        let writer = tokio::spawn(async move {
            left.write_all(&data).await.unwrap();
            left.shutdown().await.unwrap();
            left
        });

        let mut got = Vec::new();
        right.read_to_end(&mut got).await.unwrap();
        assert_eq!(got, expected);

        drop(right);
        drop(writer.await.unwrap());
        let _ = task.await.unwrap();
    }
}

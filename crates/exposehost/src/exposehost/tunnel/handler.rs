use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::exposehost::tunnel::{
    codec::{self, HEADER_LEN, Packet},
    error::TunnelError,
    transport::BoxedStream,
};

const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Sends and receives whole packets over one duplex stream.
///
/// `send` takes `&mut self`, so a handler has exactly one writer at a time. Reads go
/// straight to the stream without buffering, which keeps [`ProtocolHandler::into_inner`]
/// safe for connections that switch to raw relaying after their first packet.
pub struct ProtocolHandler<S = BoxedStream> {
    stream: S,
    closed: bool,
}

impl<S> std::fmt::Debug for ProtocolHandler<S> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProtocolHandler")
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl<S> ProtocolHandler<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            closed: false,
        }
    }

    pub async fn send(&mut self, packet: &Packet) -> Result<(), TunnelError> {
        if self.closed {
            return Err(TunnelError::ConnectionClosed);
        }
        let frame = codec::encode_frame(packet)?;
        self.stream
            .write_all(&frame)
            .await
            .map_err(TunnelError::from_stream_io)?;
        self.stream
            .flush()
            .await
            .map_err(TunnelError::from_stream_io)?;
        Ok(())
    }

    /// Reads exactly one packet. Never yields a partial packet: if the peer goes away
    /// before the header or the declared payload is complete, this fails with
    /// [`TunnelError::ConnectionClosed`].
    pub async fn recv(&mut self) -> Result<Packet, TunnelError> {
        if self.closed {
            return Err(TunnelError::ConnectionClosed);
        }
        let mut header = [0u8; HEADER_LEN];
        self.stream
            .read_exact(&mut header)
            .await
            .map_err(TunnelError::from_stream_io)?;
        let (kind, len) = codec::parse_header(&header)?;

        let mut payload = vec![0u8; len as usize];
        self.stream
            .read_exact(&mut payload)
            .await
            .map_err(TunnelError::from_stream_io)?;
        Ok(codec::decode(kind, &payload)?)
    }

    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        let _ = tokio::time::timeout(CLOSE_TIMEOUT, self.stream.shutdown()).await;
    }

    #[cfg(test)]
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exposehost::tunnel::codec::{KillServerConnection, LoadbalanceResponse};

    #[tokio::test]
    async fn packets_arrive_in_send_order() {
        let (a, b) = tokio::io::duplex(1024);
        let mut tx = ProtocolHandler::new(a);
        let mut rx = ProtocolHandler::new(b);

        let w = tokio::spawn(async move {
            tx.send(&Packet::HeartBeat).await.unwrap();
            tx.send(&Packet::LoadbalanceResponse(LoadbalanceResponse { new_port: 9 }))
                .await
                .unwrap();
            tx.send(&Packet::KillServerConnection(KillServerConnection {
                reason: "bye".into(),
            }))
            .await
            .unwrap();
        });

        assert_eq!(rx.recv().await.unwrap(), Packet::HeartBeat);
        assert_eq!(
            rx.recv().await.unwrap(),
            Packet::LoadbalanceResponse(LoadbalanceResponse { new_port: 9 })
        );
        match rx.recv().await.unwrap() {
            Packet::KillServerConnection(k) => assert_eq!(k.reason, "bye"),
            other => panic!("unexpected: {other:?}"),
        }
        w.await.unwrap();
    }

    #[tokio::test]
    async fn recv_reassembles_byte_at_a_time_writes() {
        let (mut a, b) = tokio::io::duplex(16);
        let frame = codec::encode_frame(&Packet::LoadbalanceResponse(LoadbalanceResponse {
            new_port: 1436,
        }))
        .unwrap();

        tokio::spawn(async move {
            for byte in frame {
                a.write_all(&[byte]).await.unwrap();
                tokio::task::yield_now().await;
            }
        });

        let mut rx = ProtocolHandler::new(b);
        assert_eq!(
            rx.recv().await.unwrap(),
            Packet::LoadbalanceResponse(LoadbalanceResponse { new_port: 1436 })
        );
    }

    #[tokio::test]
    async fn truncated_header_fails_with_connection_closed() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&[1, 0, 0]).await.unwrap();
        drop(a);

        let mut rx = ProtocolHandler::new(b);
        assert!(matches!(rx.recv().await, Err(TunnelError::ConnectionClosed)));
    }

    #[tokio::test]
    async fn truncated_payload_suspends_then_fails_with_connection_closed() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&codec::encode_header(7, 16)).await.unwrap();
        a.write_all(b"{\"new_").await.unwrap();

        let reader = tokio::spawn(async move {
            let mut rx = ProtocolHandler::new(b);
            rx.recv().await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!reader.is_finished(), "recv must wait for the full payload");

        drop(a);
        let res = reader.await.unwrap();
        assert!(matches!(res, Err(TunnelError::ConnectionClosed)), "{res:?}");
    }

    #[tokio::test]
    async fn unknown_kind_consumes_payload_then_fails() {
        let (mut a, b) = tokio::io::duplex(64);
        a.write_all(&codec::encode_header(99, 2)).await.unwrap();
        a.write_all(b"{}").await.unwrap();

        let mut rx = ProtocolHandler::new(b);
        match rx.recv().await {
            Err(TunnelError::Protocol(codec::ProtocolError::UnknownKind(99))) => {}
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn close_is_idempotent_and_blocks_further_io() {
        let (a, _b) = tokio::io::duplex(64);
        let mut h = ProtocolHandler::new(a);
        h.close().await;
        h.close().await;
        assert!(h.is_closed());
        assert!(matches!(
            h.send(&Packet::HeartBeat).await,
            Err(TunnelError::ConnectionClosed)
        ));
    }
}

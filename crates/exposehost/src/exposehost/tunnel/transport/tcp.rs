use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream};

use crate::exposehost::net;
use crate::exposehost::tunnel::transport::{
    Accepting, BoxedStream, Transport, TransportConnector, TransportDialOptions,
    TransportListenOptions, TransportListener,
};

/// Plain TCP, for local development and tests where TLS is terminated elsewhere.
pub struct TcpTransport;

impl TcpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn name(&self) -> &'static str {
        "tcp"
    }

    async fn listen(
        &self,
        addr: &str,
        _opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TcpTransportListener { ln }))
    }

    fn connector(&self, _opts: TransportDialOptions) -> anyhow::Result<Arc<dyn TransportConnector>> {
        Ok(Arc::new(TcpConnector))
    }
}

pub struct TcpTransportListener {
    ln: TcpListener,
}

#[async_trait]
impl TransportListener for TcpTransportListener {
    async fn accept(&self) -> anyhow::Result<(Accepting, SocketAddr)> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let accepting: Accepting = Box::pin(async move { Ok(Box::new(c) as BoxedStream) });
        Ok((accepting, peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

struct TcpConnector;

#[async_trait]
impl TransportConnector for TcpConnector {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        Ok(Box::new(c))
    }
}

use std::{future::Future, net::SocketAddr, pin::Pin, sync::Arc};

use async_trait::async_trait;

/// A bidirectional async byte stream.
///
/// Rust trait objects can only have a single non-auto "principal" trait, so we
/// wrap `AsyncRead + AsyncWrite` into a single trait.
pub trait AsyncStream: tokio::io::AsyncRead + tokio::io::AsyncWrite {}
impl<T> AsyncStream for T where T: tokio::io::AsyncRead + tokio::io::AsyncWrite + ?Sized {}

pub type BoxedStream = Box<dyn AsyncStream + Unpin + Send>;

/// Handshake still to be driven for an accepted connection.
///
/// Listeners hand this out instead of finishing the handshake in `accept`, so one slow
/// peer cannot stall the accept loop.
pub type Accepting = Pin<Box<dyn Future<Output = anyhow::Result<BoxedStream>> + Send>>;

#[derive(Debug, Clone, Default)]
pub struct TlsListenOptions {
    pub cert_file: String,
    pub key_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TlsDialOptions {
    pub server_name: String,
    pub insecure_skip_verify: bool,
    pub ca_file: String,
}

#[derive(Debug, Clone, Default)]
pub struct TransportListenOptions {
    pub tls: TlsListenOptions,
}

#[derive(Debug, Clone, Default)]
pub struct TransportDialOptions {
    pub tls: TlsDialOptions,
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &'static str;
    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>>;
    fn connector(&self, opts: TransportDialOptions) -> anyhow::Result<Arc<dyn TransportConnector>>;
}

#[async_trait]
pub trait TransportListener: Send + Sync {
    async fn accept(&self) -> anyhow::Result<(Accepting, SocketAddr)>;
    fn local_addr(&self) -> Option<SocketAddr>;
}

#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxedStream>;
}

pub fn parse_transport(name: &str) -> anyhow::Result<String> {
    let mut n = name.trim().to_ascii_lowercase();
    if n.is_empty() {
        n = "tls".into();
    }
    match n.as_str() {
        "tls" | "tcp" => Ok(n),
        _ => anyhow::bail!("tunnel: unknown transport {name:?} (expected tls|tcp)"),
    }
}

pub mod tcp;
pub mod tls;

pub fn transport_by_name(name: &str) -> anyhow::Result<Arc<dyn Transport>> {
    let n = parse_transport(name)?;
    match n.as_str() {
        "tcp" => Ok(Arc::new(tcp::TcpTransport::new())),
        _ => Ok(Arc::new(tls::TlsTransport::new())),
    }
}

use std::{fs, net::SocketAddr, path::Path, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use rustls::{
    ClientConfig, RootCertStore, ServerConfig,
    crypto::CryptoProvider,
    pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName},
};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::exposehost::net;
use crate::exposehost::tunnel::transport::{
    Accepting, BoxedStream, TlsDialOptions, TlsListenOptions, Transport, TransportConnector,
    TransportDialOptions, TransportListenOptions, TransportListener,
};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// TCP wrapped in TLS 1.2/1.3 (rustls, ring provider).
pub struct TlsTransport;

impl TlsTransport {
    pub fn new() -> Self {
        Self
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

#[async_trait]
impl Transport for TlsTransport {
    fn name(&self) -> &'static str {
        "tls"
    }

    async fn listen(
        &self,
        addr: &str,
        opts: TransportListenOptions,
    ) -> anyhow::Result<Box<dyn TransportListener>> {
        let server_cfg = server_config(&opts.tls)?;
        let ln = TcpListener::bind(net::normalize_bind_addr(addr).as_ref()).await?;
        Ok(Box::new(TlsTransportListener {
            ln,
            acceptor: TlsAcceptor::from(Arc::new(server_cfg)),
        }))
    }

    fn connector(&self, opts: TransportDialOptions) -> anyhow::Result<Arc<dyn TransportConnector>> {
        let client_cfg = client_config(&opts.tls)?;
        Ok(Arc::new(TlsTransportConnector {
            connector: TlsConnector::from(Arc::new(client_cfg)),
            server_name: opts.tls.server_name.trim().to_string(),
        }))
    }
}

pub struct TlsTransportListener {
    ln: TcpListener,
    acceptor: TlsAcceptor,
}

#[async_trait]
impl TransportListener for TlsTransportListener {
    async fn accept(&self) -> anyhow::Result<(Accepting, SocketAddr)> {
        let (c, peer) = self.ln.accept().await?;
        let _ = c.set_nodelay(true);
        let acceptor = self.acceptor.clone();
        let accepting: Accepting = Box::pin(async move {
            let st = tokio::time::timeout(HANDSHAKE_TIMEOUT, acceptor.accept(c))
                .await
                .context("tls: handshake timeout")??;
            Ok(Box::new(st) as BoxedStream)
        });
        Ok((accepting, peer))
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr().ok()
    }
}

struct TlsTransportConnector {
    connector: TlsConnector,
    server_name: String,
}

#[async_trait]
impl TransportConnector for TlsTransportConnector {
    async fn connect(&self, addr: &str) -> anyhow::Result<BoxedStream> {
        let name = if self.server_name.is_empty() {
            net::split_host_port(addr)
                .map(|(h, _)| h.to_string())
                .unwrap_or_else(|| "localhost".to_string())
        } else {
            self.server_name.clone()
        };
        let server_name =
            ServerName::try_from(name.clone()).with_context(|| format!("tls: bad server name {name:?}"))?;

        let c = TcpStream::connect(addr).await?;
        let _ = c.set_nodelay(true);
        let st = tokio::time::timeout(HANDSHAKE_TIMEOUT, self.connector.connect(server_name, c))
            .await
            .context("tls: handshake timeout")??;
        Ok(Box::new(st))
    }
}

pub fn server_config(opts: &TlsListenOptions) -> anyhow::Result<ServerConfig> {
    let (certs, key) = load_or_generate_cert(&opts.cert_file, &opts.key_file)?;
    let cfg = ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(certs, key)?;
    Ok(cfg)
}

pub fn client_config(opts: &TlsDialOptions) -> anyhow::Result<ClientConfig> {
    let builder = ClientConfig::builder_with_provider(provider()).with_safe_default_protocol_versions()?;

    if opts.insecure_skip_verify {
        return Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert(provider())))
            .with_no_client_auth());
    }

    let ca_file = opts.ca_file.trim();
    if ca_file.is_empty() {
        anyhow::bail!("tls: set client ca_file to trust the server certificate (or insecure_skip_verify for self-signed dev servers)");
    }
    let mut roots = RootCertStore::empty();
    for cert in load_certs(Path::new(ca_file))? {
        roots
            .add(cert)
            .with_context(|| format!("tls: add ca from {ca_file}"))?;
    }
    Ok(builder.with_root_certificates(roots).with_no_client_auth())
}

/// Loads the configured PEM pair, or generates a throwaway self-signed certificate for
/// `localhost` when neither file is set.
pub fn load_or_generate_cert(
    cert_file: &str,
    key_file: &str,
) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
    let cert_file = cert_file.trim();
    let key_file = key_file.trim();

    match (cert_file.is_empty(), key_file.is_empty()) {
        (false, false) => {
            let certs = load_certs(Path::new(cert_file))?;
            let key = load_key(Path::new(key_file))?;
            Ok((certs, key))
        }
        (true, true) => {
            tracing::warn!("tls: no cert_file/key_file configured; using a generated self-signed certificate");
            let rcgen::CertifiedKey { cert, signing_key } =
                rcgen::generate_simple_self_signed(["localhost".to_string()])?;
            let key = PrivateKeyDer::from(PrivatePkcs8KeyDer::from(signing_key.serialize_der()));
            Ok((vec![cert.der().clone()], key))
        }
        _ => anyhow::bail!("tls: set both cert_file and key_file (or neither to auto-generate)"),
    }
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let certs = rustls_pemfile::certs(&mut rd).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        anyhow::bail!("tls: no certificates found in {}", path.display());
    }
    Ok(certs)
}

fn load_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
    let data = fs::read(path).with_context(|| format!("tls: read {}", path.display()))?;
    let mut rd = std::io::Cursor::new(&data);
    let Some(key) = rustls_pemfile::private_key(&mut rd)? else {
        anyhow::bail!("tls: no private key found in {}", path.display());
    };
    Ok(key)
}

/// Verifier that trusts any server certificate while still checking handshake signatures.
///
/// NOTE: vulnerable to MITM. Only for self-signed development servers.
#[derive(Debug)]
struct AcceptAnyServerCert(Arc<CryptoProvider>);

impl rustls::client::danger::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

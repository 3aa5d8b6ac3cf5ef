use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::sync::watch;

use crate::exposehost::tunnel::{
    codec::Packet,
    edge::EdgeRouter,
    forwarder::DEFAULT_CALLBACK_TIMEOUT,
    handler::ProtocolHandler,
    registry::{HostnameRegistry, SessionRegistry},
    session::ControlSession,
    transport::{
        Accepting, TlsListenOptions, TransportListenOptions, TransportListener, transport_by_name,
    },
};

pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(10);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub tls: TlsListenOptions,
    /// Parent domain; tunnels get `<subdomain>.<domain>`.
    pub domain: String,
    /// Empty disables the token check.
    pub auth_token: String,
    pub public_bind_host: String,
    pub heartbeat_interval: Duration,
    pub callback_timeout: Duration,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1435".into(),
            transport: "tls".into(),
            tls: TlsListenOptions::default(),
            domain: "exposehost.local".into(),
            auth_token: String::new(),
            public_bind_host: "0.0.0.0".into(),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            callback_timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }
}

/// State shared by every connection of one worker.
pub struct WorkerState {
    pub opts: WorkerOptions,
    pub hostnames: HostnameRegistry,
    pub sessions: SessionRegistry,
    pub edge: Arc<dyn EdgeRouter>,
}

impl WorkerState {
    pub fn new(opts: WorkerOptions, edge: Arc<dyn EdgeRouter>) -> Arc<Self> {
        Arc::new(Self {
            opts,
            hostnames: HostnameRegistry::new(),
            sessions: SessionRegistry::new(),
            edge,
        })
    }
}

/// Accepts control and callback connections for one worker.
pub struct Server {
    state: Arc<WorkerState>,
    ln: Box<dyn TransportListener>,
    transport: &'static str,
}

impl Server {
    pub async fn bind(opts: WorkerOptions, edge: Arc<dyn EdgeRouter>) -> anyhow::Result<Self> {
        let tr = transport_by_name(&opts.transport)?;
        let ln = tr
            .listen(
                &opts.listen_addr,
                TransportListenOptions {
                    tls: opts.tls.clone(),
                },
            )
            .await
            .with_context(|| format!("tunnel: bind {}", opts.listen_addr))?;

        Ok(Self {
            state: WorkerState::new(opts, edge),
            ln,
            transport: tr.name(),
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr()
    }

    pub fn state(&self) -> Arc<WorkerState> {
        self.state.clone()
    }

    pub async fn listen_and_serve(
        opts: WorkerOptions,
        edge: Arc<dyn EdgeRouter>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        Self::bind(opts, edge).await?.serve(shutdown).await
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(
            addr = %self.state.opts.listen_addr,
            local = ?self.local_addr(),
            transport = %self.transport,
            domain = %self.state.opts.domain,
            "tunnel: listening"
        );

        loop {
            tokio::select! {
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                res = self.ln.accept() => {
                    let (accepting, peer) = match res {
                        Ok(v) => v,
                        Err(err) => {
                            tracing::warn!(err = %err, "tunnel: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let state = self.state.clone();
                    tokio::spawn(async move {
                        handle_conn(state, accepting, peer).await;
                    });
                }
            }
        }

        self.state.sessions.kill_all("server shutting down");
        let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
        while !self.state.sessions.is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tracing::info!(remaining = self.state.sessions.len(), "tunnel: stopped");
        Ok(())
    }
}

/// Routes a new connection by its first packet: a TunnelRequest opens a control
/// session, a NewConnectionHostResponse completes a pending pairing.
async fn handle_conn(state: Arc<WorkerState>, accepting: Accepting, peer: SocketAddr) {
    let stream = match accepting.await {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "tunnel: handshake failed");
            return;
        }
    };
    let mut handler = ProtocolHandler::new(stream);

    let first = match tokio::time::timeout(FIRST_PACKET_TIMEOUT, handler.recv()).await {
        Ok(Ok(p)) => p,
        Ok(Err(err)) => {
            tracing::debug!(client = %peer, err = %err, "tunnel: bad first packet");
            handler.close().await;
            return;
        }
        Err(_) => {
            tracing::debug!(client = %peer, "tunnel: first packet timeout");
            handler.close().await;
            return;
        }
    };

    match first {
        Packet::TunnelRequest(req) => {
            ControlSession::new(state, handler, peer.to_string())
                .run(req)
                .await;
        }
        Packet::NewConnectionHostResponse(r) => {
            let Some(fwd) = state.sessions.forwarder_for(&r.connection_id) else {
                tracing::debug!(client = %peer, connection_id = %r.connection_id, "tunnel: callback for unknown connection");
                handler.close().await;
                return;
            };
            if let Err(err) = fwd.attach_host(&r.connection_id, handler.into_inner()) {
                tracing::debug!(client = %peer, err = %err, "tunnel: callback not paired");
            }
        }
        other => {
            tracing::debug!(client = %peer, kind = %other.kind(), "tunnel: unexpected first packet");
            handler.close().await;
        }
    }
}

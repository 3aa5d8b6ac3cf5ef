//! Server side of one control connection.

use std::{sync::Arc, time::Duration};

use tokio::{sync::mpsc, time::MissedTickBehavior};

use crate::exposehost::{
    telemetry,
    tunnel::{
        codec::{
            KillServerConnection, NewClientConnection, Packet, TunnelProtocol, TunnelRequest,
            TunnelResponse,
        },
        error::TunnelError,
        forwarder::Forwarder,
        handler::ProtocolHandler,
        registry::{TunnelInfo, random_hex},
        server::WorkerState,
    },
};

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const KILL_SEND_TIMEOUT: Duration = Duration::from_secs(1);
const MAX_LABEL_LEN: usize = 63;

pub const REASON_CLIENT_CLOSED: &str = "connection closed by client";
pub const REASON_HEARTBEAT: &str = "connection closed during heartbeat check";
pub const REASON_CALLBACK_TIMEOUT: &str = "host did not respond in time";

/// Work handed to a session by its forwarder or its worker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A public peer connected and waits under this connection id.
    NewConnection(String),
    /// The client never dialed back for this connection id.
    CallbackTimeout(String),
    /// Tear the session down with the given reason.
    Kill(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Validating,
    Active,
    Closing,
    Closed,
}

struct ActiveTunnel {
    hostname: String,
    protocol: TunnelProtocol,
    client_key: String,
    forwarder: Arc<Forwarder>,
}

pub struct ControlSession {
    id: String,
    peer: String,
    worker: Arc<WorkerState>,
    handler: ProtocolHandler,
    state: SessionState,
    events_tx: mpsc::UnboundedSender<SessionEvent>,
    events_rx: mpsc::UnboundedReceiver<SessionEvent>,
    tunnel: Option<ActiveTunnel>,
}

impl ControlSession {
    pub fn new(worker: Arc<WorkerState>, handler: ProtocolHandler, peer: String) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            id: telemetry::new_session_id(),
            peer,
            worker,
            handler,
            state: SessionState::Validating,
            events_tx,
            events_rx,
            tunnel: None,
        }
    }

    /// Drives the session from its TunnelRequest until it is closed.
    pub async fn run(mut self, request: TunnelRequest) -> SessionState {
        if let Err(detail) = self.activate(&request).await {
            tracing::info!(sid = %self.id, client = %self.peer, subdomain = %request.subdomain, err = %detail, "session: tunnel rejected");
            let _ = tokio::time::timeout(
                SEND_TIMEOUT,
                self.handler
                    .send(&Packet::TunnelResponse(TunnelResponse::error(detail))),
            )
            .await;
            self.handler.close().await;
            self.state = SessionState::Closed;
            return self.state;
        }

        let mut ticker = tokio::time::interval(self.worker.opts.heartbeat_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while self.state == SessionState::Active {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.send(&Packet::HeartBeat).await {
                        tracing::debug!(sid = %self.id, err = %err, "session: heartbeat failed");
                        self.kill_server(REASON_HEARTBEAT).await;
                    }
                }
                Some(ev) = self.events_rx.recv() => match ev {
                    SessionEvent::NewConnection(id) => self.new_tunnel_connection(&id).await,
                    SessionEvent::CallbackTimeout(_) => self.kill_server(REASON_CALLBACK_TIMEOUT).await,
                    SessionEvent::Kill(reason) => self.kill_server(&reason).await,
                },
            }
        }
        self.state
    }

    /// Validates the request, claims the hostname, starts the forwarder and answers with
    /// a successful TunnelResponse. Returns the error text for a rejected request.
    async fn activate(&mut self, req: &TunnelRequest) -> Result<(), String> {
        let opts = &self.worker.opts;
        if !opts.auth_token.is_empty() && req.token != opts.auth_token {
            return Err("invalid auth token".into());
        }
        let subdomain = normalize_subdomain(&req.subdomain).ok_or("invalid subdomain")?;
        let hostname = if opts.domain.is_empty() {
            subdomain
        } else {
            format!("{subdomain}.{}", opts.domain)
        };

        if let Err(err) = self.worker.hostnames.claim(&hostname, &self.id) {
            tracing::debug!(sid = %self.id, err = %err, "session: hostname taken");
            return Err("subdomain already in use".into());
        }

        let forwarder = match Forwarder::start(
            &opts.public_bind_host,
            self.events_tx.clone(),
            opts.callback_timeout,
        )
        .await
        {
            Ok(f) => f,
            Err(err) => {
                tracing::warn!(sid = %self.id, hostname = %hostname, err = %err, "session: public listener failed");
                self.worker.hostnames.release(&hostname, &self.id);
                return Err("failed to allocate public port".into());
            }
        };

        let port = forwarder.port();
        let url = match req.protocol {
            TunnelProtocol::Http => format!("https://{hostname}"),
            TunnelProtocol::Tcp => hostname.clone(),
        };

        self.worker.sessions.add(
            TunnelInfo {
                id: self.id.clone(),
                client: self.peer.clone(),
                hostname: hostname.clone(),
                protocol: req.protocol,
                public_port: port,
                url: url.clone(),
                started_at_unix_ms: telemetry::now_unix_ms(),
            },
            forwarder.clone(),
            self.events_tx.clone(),
        );
        if req.protocol == TunnelProtocol::Http {
            self.worker.edge.publish_route(&hostname, port);
        }
        metrics::gauge!("exposehost_tunnels_active").increment(1.0);

        self.tunnel = Some(ActiveTunnel {
            hostname: hostname.clone(),
            protocol: req.protocol,
            client_key: req.session_key.clone(),
            forwarder,
        });
        self.state = SessionState::Active;

        tracing::info!(sid = %self.id, client = %self.peer, hostname = %hostname, protocol = %req.protocol, port, "session: tunnel active");

        if let Err(err) = self
            .send(&Packet::TunnelResponse(TunnelResponse::success(port, url)))
            .await
        {
            tracing::debug!(sid = %self.id, err = %err, "session: response write failed");
            self.kill_server(REASON_CLIENT_CLOSED).await;
        }
        Ok(())
    }

    /// Tells the client to dial back for `connection_id`.
    pub async fn new_tunnel_connection(&mut self, connection_id: &str) {
        let Some(client_key) = self.tunnel.as_ref().map(|t| t.client_key.clone()) else {
            return;
        };
        let packet = Packet::NewClientConnection(NewClientConnection {
            connection_id: connection_id.to_string(),
            session_key: client_key,
        });
        if let Err(err) = self.send(&packet).await {
            tracing::debug!(sid = %self.id, connection_id = %connection_id, err = %err, "session: notify failed");
            self.kill_server(REASON_CLIENT_CLOSED).await;
        }
    }

    /// Tears the session down. Safe to call more than once.
    pub async fn kill_server(&mut self, reason: &str) {
        if matches!(self.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        self.state = SessionState::Closing;

        let kill = Packet::KillServerConnection(KillServerConnection {
            reason: reason.to_string(),
        });
        let _ = tokio::time::timeout(KILL_SEND_TIMEOUT, self.handler.send(&kill)).await;

        if let Some(t) = self.tunnel.take() {
            t.forwarder.stop();
            self.worker.hostnames.release(&t.hostname, &self.id);
            if t.protocol == TunnelProtocol::Http {
                self.worker.edge.withdraw_route(&t.hostname);
            }
            self.worker.sessions.remove(&self.id);
            metrics::gauge!("exposehost_tunnels_active").decrement(1.0);
            tracing::info!(sid = %self.id, hostname = %t.hostname, reason = %reason, "session: closed");
        }

        self.handler.close().await;
        self.state = SessionState::Closed;
    }

    async fn send(&mut self, packet: &Packet) -> Result<(), TunnelError> {
        match tokio::time::timeout(SEND_TIMEOUT, self.handler.send(packet)).await {
            Ok(res) => res,
            Err(_) => Err(TunnelError::ConnectionClosed),
        }
    }
}

/// Lowercases and checks a requested subdomain. An empty request gets a random label.
pub fn normalize_subdomain(raw: &str) -> Option<String> {
    let s = raw.trim().to_ascii_lowercase();
    if s.is_empty() {
        return Some(random_hex(8));
    }
    if s.len() > MAX_LABEL_LEN || s.starts_with('-') || s.ends_with('-') {
        return None;
    }
    if !s
        .bytes()
        .all(|b| b.is_ascii_lowercase() || b.is_ascii_digit() || b == b'-')
    {
        return None;
    }
    Some(s)
}

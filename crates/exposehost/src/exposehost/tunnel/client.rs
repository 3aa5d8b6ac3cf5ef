use std::{sync::Arc, time::Duration};

use anyhow::Context;
use arc_swap::ArcSwap;
use serde::Serialize;
use tokio::{
    io::AsyncReadExt,
    net::TcpStream,
    sync::mpsc,
    task::{JoinHandle, JoinSet},
};

use crate::exposehost::{
    net,
    tunnel::{
        codec::{
            NewConnectionHostResponse, PAIRING_ACK, Packet, TunnelProtocol, TunnelRequest,
            TunnelResponse, TunnelStatus,
        },
        error::TunnelError,
        handler::ProtocolHandler,
        registry::random_hex,
        relay,
        transport::{TlsDialOptions, TransportConnector, TransportDialOptions, transport_by_name},
    },
};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub server_addr: String,
    pub transport: String,
    pub tls: TlsDialOptions,
    pub auth_token: String,
    pub subdomain: String,
    pub protocol: TunnelProtocol,
    /// Local service the tunnel exposes, `host:port`.
    pub local_addr: String,
    pub dial_timeout: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ClientStatus {
    Stopped,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct ClientSnapshot {
    pub status: ClientStatus,
    pub url: String,
    pub public_port: u16,
    pub forwarded_port: u16,
    pub last_error: String,
}

enum Command {
    Stop,
    ForwardPort(u16),
}

/// Foreground side of a running client.
///
/// Reads are lock-free snapshot loads; control goes through a command channel to the
/// client task. Dropping the handle stops the client.
pub struct ClientHandle {
    snapshot: Arc<ArcSwap<ClientSnapshot>>,
    commands: mpsc::UnboundedSender<Command>,
    task: JoinHandle<()>,
}

// Field accessors for embedders; the binary reads whole snapshots.
#[allow(dead_code)]
impl ClientHandle {
    pub fn status(&self) -> ClientStatus {
        self.snapshot.load().status
    }

    pub fn url(&self) -> String {
        self.snapshot.load().url.clone()
    }

    pub fn public_port(&self) -> u16 {
        self.snapshot.load().public_port
    }

    pub fn forwarded_port(&self) -> u16 {
        self.snapshot.load().forwarded_port
    }

    pub fn last_error(&self) -> String {
        self.snapshot.load().last_error.clone()
    }

    /// Later callbacks dial this local port instead of the configured one.
    pub fn forward_port(&self, port: u16) {
        let _ = self.commands.send(Command::ForwardPort(port));
    }
}

impl ClientHandle {
    pub fn snapshot(&self) -> Arc<ClientSnapshot> {
        self.snapshot.load_full()
    }

    /// Control surface for other tasks. It does not keep the client alive.
    pub fn control(&self) -> ClientControl {
        ClientControl {
            snapshot: self.snapshot.clone(),
            commands: self.commands.downgrade(),
        }
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    /// Resolves once the client task ends on its own. Call at most once, and not
    /// after [`ClientHandle::wait`].
    pub async fn finished(&mut self) -> Arc<ClientSnapshot> {
        let _ = (&mut self.task).await;
        self.snapshot.load_full()
    }

    /// Waits for the client task to end and returns its final snapshot.
    pub async fn wait(self) -> Arc<ClientSnapshot> {
        let ClientHandle {
            snapshot,
            commands,
            task,
        } = self;
        let _ = task.await;
        drop(commands);
        snapshot.load_full()
    }
}

/// Cloneable view of a running client, used by the admin API.
#[derive(Clone)]
pub struct ClientControl {
    snapshot: Arc<ArcSwap<ClientSnapshot>>,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl ClientControl {
    pub fn snapshot(&self) -> Arc<ClientSnapshot> {
        self.snapshot.load_full()
    }

    /// Same as [`ClientHandle::forward_port`]. Returns false once the client is gone.
    pub fn forward_port(&self, port: u16) -> bool {
        self.commands
            .upgrade()
            .is_some_and(|tx| tx.send(Command::ForwardPort(port)).is_ok())
    }
}

pub struct Client {
    opts: ClientOptions,
    local_host: String,
    session_key: String,
    connector: Arc<dyn TransportConnector>,
    snapshot: Arc<ArcSwap<ClientSnapshot>>,
}

impl Client {
    /// Validates `opts` and starts the client task.
    pub fn start(mut opts: ClientOptions) -> anyhow::Result<ClientHandle> {
        if opts.server_addr.trim().is_empty() {
            anyhow::bail!("tunnel: client server_addr is required");
        }
        let (local_host, local_port) = net::split_host_port(&opts.local_addr)
            .map(|(h, p)| (h.to_string(), p))
            .with_context(|| format!("tunnel: bad client local_addr {:?}", opts.local_addr))?;
        if opts.dial_timeout.is_zero() {
            opts.dial_timeout = Duration::from_secs(5);
        }
        let connector = transport_by_name(&opts.transport)?.connector(TransportDialOptions {
            tls: opts.tls.clone(),
        })?;

        let snapshot = Arc::new(ArcSwap::from_pointee(ClientSnapshot {
            status: ClientStatus::Stopped,
            url: String::new(),
            public_port: 0,
            forwarded_port: local_port,
            last_error: String::new(),
        }));
        let (commands, cmd_rx) = mpsc::unbounded_channel();

        let client = Client {
            opts,
            local_host,
            session_key: random_hex(64),
            connector,
            snapshot: snapshot.clone(),
        };
        let task = tokio::spawn(client.run(cmd_rx));

        Ok(ClientHandle {
            snapshot,
            commands,
            task,
        })
    }

    fn update(&self, f: impl FnOnce(&mut ClientSnapshot)) {
        let mut next = ClientSnapshot::clone(&self.snapshot.load());
        f(&mut next);
        self.snapshot.store(Arc::new(next));
    }

    fn fail(&self, err: impl std::fmt::Display) {
        let msg = err.to_string();
        tracing::warn!(server = %self.opts.server_addr, err = %msg, "tunnel: client failed");
        self.update(|s| {
            s.status = ClientStatus::Failed;
            s.last_error = msg;
        });
    }

    async fn run(self, mut cmd_rx: mpsc::UnboundedReceiver<Command>) {
        self.update(|s| s.status = ClientStatus::Connecting);

        let connected = tokio::select! {
            res = self.connect() => res,
            _ = self.wait_for_stop(&mut cmd_rx) => {
                self.update(|s| s.status = ClientStatus::Stopped);
                return;
            }
        };
        let (handler, resp, control_addr) = match connected {
            Ok(v) => v,
            Err(err) => {
                self.fail(format!("{err:#}"));
                return;
            }
        };

        if resp.status == TunnelStatus::Error {
            self.fail(&resp.error);
            return;
        }

        tracing::info!(url = %resp.url, port = resp.port, server = %control_addr, "tunnel: client connected");
        self.update(|s| {
            s.status = ClientStatus::Connected;
            s.url = resp.url.clone();
            s.public_port = resp.port;
            s.last_error.clear();
        });

        let (pkt_tx, mut pkt_rx) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_packets(handler, pkt_tx));
        let mut forwards = JoinSet::new();

        loop {
            tokio::select! {
                cmd = cmd_rx.recv() => match cmd {
                    Some(Command::ForwardPort(port)) => {
                        tracing::info!(port, "tunnel: forwarding callbacks to new local port");
                        self.update(|s| s.forwarded_port = port);
                    }
                    Some(Command::Stop) | None => {
                        self.update(|s| s.status = ClientStatus::Stopped);
                        break;
                    }
                },
                pkt = pkt_rx.recv() => match pkt {
                    Some(Ok(Packet::NewClientConnection(n))) => {
                        let local = format!("{}:{}", self.local_host, self.snapshot.load().forwarded_port);
                        forwards.spawn(forward_tcp(
                            self.connector.clone(),
                            control_addr.clone(),
                            n.connection_id,
                            local,
                            self.opts.dial_timeout,
                        ));
                    }
                    Some(Ok(Packet::HeartBeat)) => {}
                    Some(Ok(Packet::KillServerConnection(k))) => {
                        self.fail(format!("server closed the tunnel: {}", k.reason));
                        break;
                    }
                    Some(Ok(other)) => {
                        tracing::debug!(kind = %other.kind(), "tunnel: ignoring unexpected packet");
                    }
                    Some(Err(err)) => {
                        self.fail(format!("control connection lost: {err}"));
                        break;
                    }
                    None => {
                        self.fail("control connection lost");
                        break;
                    }
                },
                Some(res) = forwards.join_next(), if !forwards.is_empty() => {
                    if let Ok(Err(err)) = res {
                        tracing::debug!(err = %err, "tunnel: callback ended with error");
                    }
                }
            }
        }

        reader.abort();
        forwards.shutdown().await;
    }

    /// Resolves on Stop or when every sender is gone. Port changes that arrive while
    /// connecting are applied to the snapshot so the first callback already uses them.
    async fn wait_for_stop(&self, rx: &mut mpsc::UnboundedReceiver<Command>) {
        loop {
            match rx.recv().await {
                Some(Command::Stop) | None => return,
                Some(Command::ForwardPort(port)) => {
                    tracing::info!(port, "tunnel: forwarding callbacks to new local port");
                    self.update(|s| s.forwarded_port = port);
                }
            }
        }
    }

    /// Dials the server, sends the TunnelRequest and follows at most one redirect.
    /// Returns the control handler, the response and the address that answered it.
    async fn connect(&self) -> anyhow::Result<(ProtocolHandler, TunnelResponse, String)> {
        let port = self.snapshot.load().forwarded_port;
        let req = Packet::TunnelRequest(TunnelRequest {
            token: self.opts.auth_token.clone(),
            subdomain: self.opts.subdomain.clone(),
            protocol: self.opts.protocol,
            session_key: self.session_key.clone(),
            port,
        });

        let mut addr = self.opts.server_addr.trim().to_string();
        let mut redirected = false;
        loop {
            let stream = tokio::time::timeout(self.opts.dial_timeout, self.connector.connect(&addr))
                .await
                .with_context(|| format!("tunnel: dial {addr} timed out"))?
                .with_context(|| format!("tunnel: dial {addr}"))?;
            let mut h = ProtocolHandler::new(stream);
            h.send(&req).await?;

            match h.recv().await? {
                Packet::TunnelResponse(resp) => return Ok((h, resp, addr)),
                Packet::LoadbalanceResponse(lb) => {
                    h.close().await;
                    if redirected {
                        anyhow::bail!("tunnel: redirected twice (second target port {})", lb.new_port);
                    }
                    redirected = true;
                    let next = net::with_port(&addr, lb.new_port)
                        .with_context(|| format!("tunnel: cannot redirect {addr}"))?;
                    tracing::info!(from = %addr, to = %next, "tunnel: redirected to worker");
                    addr = next;
                }
                other => anyhow::bail!("tunnel: unexpected {} before tunnel response", other.kind()),
            }
        }
    }
}

async fn read_packets(
    mut handler: ProtocolHandler,
    tx: mpsc::UnboundedSender<Result<Packet, TunnelError>>,
) {
    loop {
        let res = handler.recv().await;
        let done = res.is_err();
        if tx.send(res).is_err() || done {
            break;
        }
    }
    handler.close().await;
}

/// Answers one NewClientConnection: dials back, identifies the connection, waits for
/// the pairing ack and relays to the local service.
async fn forward_tcp(
    connector: Arc<dyn TransportConnector>,
    control_addr: String,
    connection_id: String,
    local_addr: String,
    dial_timeout: Duration,
) -> anyhow::Result<()> {
    let stream = tokio::time::timeout(dial_timeout, connector.connect(&control_addr))
        .await
        .context("tunnel: callback dial timed out")??;
    let mut h = ProtocolHandler::new(stream);
    h.send(&Packet::NewConnectionHostResponse(NewConnectionHostResponse {
        connection_id: connection_id.clone(),
    }))
    .await?;

    let mut remote = h.into_inner();
    let mut ack = [0u8; 1];
    tokio::time::timeout(dial_timeout, remote.read_exact(&mut ack))
        .await
        .context("tunnel: pairing ack timed out")??;
    if ack[0] != PAIRING_ACK {
        anyhow::bail!("tunnel: bad pairing ack {:#04x}", ack[0]);
    }

    let local = tokio::time::timeout(dial_timeout, TcpStream::connect(&local_addr))
        .await
        .context("tunnel: local dial timed out")?
        .with_context(|| format!("tunnel: dial local service {local_addr}"))?;
    let _ = local.set_nodelay(true);

    let (up, down) = relay::relay(remote, local).await?;
    tracing::debug!(connection_id = %connection_id, up, down, "tunnel: callback closed");
    Ok(())
}

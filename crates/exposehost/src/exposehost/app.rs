use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use tokio::{sync::watch, task::JoinSet};

use crate::exposehost::{
    admin, config, logging, net, telemetry,
    tunnel::{
        balancer::{Balancer, BalancerOptions, WorkerPool},
        client::{Client, ClientHandle, ClientOptions, ClientStatus},
        edge::{EdgeRouter, LogEdgeRouter},
        server::{Server, WorkerOptions},
        transport::{TlsDialOptions, TlsListenOptions},
    },
};

const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Runs every role the config asks for until a signal arrives or a role fails.
///
/// `worker_port` is set only for processes the balancer spawns; they run the
/// `[server]` section on that port and nothing else.
pub async fn run(config_path: Option<PathBuf>, worker_port: Option<u16>) -> anyhow::Result<()> {
    let resolved = config::resolve_config_path(config_path)?;

    let created = config::ensure_config_file(&resolved.path)?;

    let cfg = config::load_config(&resolved.path)
        .with_context(|| format!("load config: {}", resolved.path.display()))?;

    let logrt = logging::init(&cfg.logging)?;
    let _logrt_guard = logrt;

    if created {
        tracing::warn!(path = %resolved.path.display(), source = %resolved.source, "config: created new config file");
    }

    let worker_mode = worker_port.is_some();
    let balancer_enabled = !worker_mode && cfg.balancer.is_some();
    let server_enabled = cfg.server.is_some() && !balancer_enabled;
    let client_enabled = !worker_mode && cfg.client.is_some();
    let admin_enabled = !worker_mode && !cfg.admin_addr.trim().is_empty();

    if worker_mode && cfg.server.is_none() {
        anyhow::bail!("config: --worker-port needs a [server] section");
    }

    tracing::info!(
        config = %resolved.path.display(),
        worker_port = ?worker_port,
        balancer_enabled,
        server_enabled,
        client_enabled,
        admin_addr = %cfg.admin_addr,
        "exposehost: starting"
    );

    let prom = Arc::new(telemetry::init_prometheus()?);
    let edge: Arc<dyn EdgeRouter> = Arc::new(LogEdgeRouter);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    let mut admin_state = admin::AdminState {
        prom,
        worker: None,
        pool: None,
        client: None,
    };

    // Front door plus its worker processes.
    if balancer_enabled {
        if let (Some(b), Some(s)) = (&cfg.balancer, &cfg.server) {
            let pool = if b.worker_ports.is_empty() {
                WorkerPool::spawn(b.workers, b.worker_base_port, &resolved.path)?
            } else {
                tracing::info!(ports = ?b.worker_ports, "balancer: using externally managed workers");
                WorkerPool::from_ports(b.worker_ports.iter().copied())
            };
            let pool = Arc::new(pool);
            admin_state.pool = Some(pool.clone());
            let opts = BalancerOptions {
                listen_addr: b.listen_addr.clone(),
                transport: s.transport.clone(),
                tls: tls_listen_options(s),
            };
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { Balancer::listen_and_serve(opts, pool, shutdown).await });
        }
    }

    // Tunnel server, standalone or as a balancer worker.
    if server_enabled {
        if let Some(s) = &cfg.server {
            let listen_addr = match worker_port {
                Some(port) => worker_listen_addr(&s.listen_addr, port),
                None => s.listen_addr.clone(),
            };
            let opts = worker_options(s, listen_addr);
            tracing::info!(
                heartbeat = %humantime::format_duration(opts.heartbeat_interval),
                callback_timeout = %humantime::format_duration(opts.callback_timeout),
                auth = !opts.auth_token.is_empty(),
                "tunnel: server settings"
            );
            let shutdown = shutdown_rx.clone();
            if worker_mode {
                // Workers have no admin API, so nothing needs the server state.
                let edge = edge.clone();
                tasks.spawn(async move { Server::listen_and_serve(opts, edge, shutdown).await });
            } else {
                let server = Server::bind(opts, edge.clone()).await?;
                admin_state.worker = Some(server.state());
                tasks.spawn(async move { server.serve(shutdown).await });
            }
        }
    }

    // Tunnel client.
    if client_enabled {
        if let Some(c) = &cfg.client {
            let handle = Client::start(client_options(c))?;
            admin_state.client = Some(handle.control());
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { supervise_client(handle, shutdown).await });
        }
    }

    if admin_enabled {
        let admin_addr = net::normalize_bind_addr(&cfg.admin_addr);
        let addr: SocketAddr = admin_addr
            .parse()
            .with_context(|| format!("invalid admin_addr: {}", cfg.admin_addr))?;
        let shutdown = shutdown_rx.clone();
        tasks.spawn(async move { admin::serve_with_shutdown(addr, admin_state, shutdown).await });
    }

    // Wait for shutdown signal (Ctrl-C / SIGTERM) or a role ending on its own.
    let mut result = Ok(());
    tokio::select! {
        _ = shutdown_signal() => {
            tracing::info!("shutdown: signal");
        }
        res = tasks.join_next() => {
            match res {
                Some(Ok(Ok(()))) | None => tracing::info!("shutdown: role finished"),
                Some(Ok(Err(err))) => result = Err(err),
                Some(Err(join_err)) => result = Err(join_err.into()),
            }
        }
    }
    let _ = shutdown_tx.send(true);

    let drain = async {
        while let Some(res) = tasks.join_next().await {
            if let Ok(Err(err)) = res {
                tracing::debug!(err = %err, "shutdown: role ended with error");
            }
        }
    };
    if tokio::time::timeout(DRAIN_TIMEOUT, drain).await.is_err() {
        tracing::warn!(timeout = %humantime::format_duration(DRAIN_TIMEOUT), "shutdown: drain timed out");
        tasks.abort_all();
        while tasks.join_next().await.is_some() {}
    }

    result
}

/// Keeps the client running until shutdown. A client that fails on its own ends the process.
async fn supervise_client(
    mut handle: ClientHandle,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let stopped = tokio::select! {
        _ = handle.finished() => false,
        _ = wait_for_shutdown(&mut shutdown) => true,
    };
    let snap = if stopped {
        handle.stop();
        handle.wait().await
    } else {
        handle.snapshot()
    };
    match snap.status {
        ClientStatus::Failed => anyhow::bail!("tunnel client: {}", snap.last_error),
        _ => Ok(()),
    }
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

fn worker_listen_addr(listen_addr: &str, port: u16) -> String {
    net::with_port(listen_addr, port).unwrap_or_else(|| format!(":{port}"))
}

fn tls_listen_options(s: &config::ServerConfig) -> TlsListenOptions {
    TlsListenOptions {
        cert_file: s.tls.cert_file.clone(),
        key_file: s.tls.key_file.clone(),
    }
}

fn worker_options(s: &config::ServerConfig, listen_addr: String) -> WorkerOptions {
    WorkerOptions {
        listen_addr,
        transport: s.transport.clone(),
        tls: tls_listen_options(s),
        domain: s.domain.clone(),
        auth_token: s.auth_token.clone(),
        public_bind_host: s.public_bind_host.clone(),
        heartbeat_interval: s.heartbeat_interval,
        callback_timeout: s.callback_timeout,
    }
}

fn client_options(c: &config::ClientConfig) -> ClientOptions {
    ClientOptions {
        server_addr: c.server_addr.clone(),
        transport: c.transport.clone(),
        tls: TlsDialOptions {
            server_name: c.server_name.clone(),
            insecure_skip_verify: c.insecure_skip_verify,
            ca_file: c.ca_file.clone(),
        },
        auth_token: c.auth_token.clone(),
        subdomain: c.subdomain.clone(),
        protocol: c.protocol,
        local_addr: c.local_addr.clone(),
        dial_timeout: c.dial_timeout,
    }
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(err) => {
                tracing::warn!(err = %err, "shutdown: SIGTERM handler unavailable");
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

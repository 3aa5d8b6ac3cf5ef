//! Front door that spreads new tunnels across worker processes.
//!
//! The balancer only ever reads the first packet of a connection. A TunnelRequest
//! is answered with a LoadbalanceResponse naming the least-assigned worker; the
//! client then repeats its request there. No tunnel state lives here.

use std::{
    net::SocketAddr,
    path::Path,
    process::Stdio,
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use anyhow::Context;
use serde::Serialize;
use tokio::{process::Child, sync::watch};

use crate::exposehost::tunnel::{
    codec::{LoadbalanceResponse, Packet},
    handler::ProtocolHandler,
    transport::{
        Accepting, TlsListenOptions, TransportListenOptions, TransportListener, transport_by_name,
    },
};

const FIRST_PACKET_TIMEOUT: Duration = Duration::from_secs(10);

struct WorkerRecord {
    port: u16,
    assigned: u64,
    child: Option<Child>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkerInfo {
    pub port: u16,
    pub assigned: u64,
    pub pid: Option<u32>,
}

/// Worker ports with their assignment counters. Counters only ever grow.
pub struct WorkerPool {
    workers: Mutex<Vec<WorkerRecord>>,
}

impl WorkerPool {
    /// Pool over workers that something else runs.
    pub fn from_ports(ports: impl IntoIterator<Item = u16>) -> Self {
        let workers = ports
            .into_iter()
            .map(|port| WorkerRecord {
                port,
                assigned: 0,
                child: None,
            })
            .collect();
        Self {
            workers: Mutex::new(workers),
        }
    }

    /// Starts `count` copies of this executable as workers on `base_port`,
    /// `base_port + 1`, ... Children are killed when the pool is dropped.
    pub fn spawn(count: usize, base_port: u16, config_path: &Path) -> anyhow::Result<Self> {
        let exe = std::env::current_exe().context("balancer: locate current executable")?;
        let mut workers = Vec::with_capacity(count);
        for i in 0..count {
            let port = u16::try_from(i)
                .ok()
                .and_then(|i| base_port.checked_add(i))
                .context("balancer: worker port out of range")?;
            let child = tokio::process::Command::new(&exe)
                .arg("--config")
                .arg(config_path)
                .arg("--worker-port")
                .arg(port.to_string())
                .stdin(Stdio::null())
                .kill_on_drop(true)
                .spawn()
                .with_context(|| format!("balancer: spawn worker on port {port}"))?;
            tracing::info!(port, pid = ?child.id(), "balancer: worker started");
            workers.push(WorkerRecord {
                port,
                assigned: 0,
                child: Some(child),
            });
        }
        Ok(Self {
            workers: Mutex::new(workers),
        })
    }

    /// Picks the worker with the lowest counter (earliest in the pool on ties) and
    /// counts the assignment.
    pub fn assign(&self) -> Option<u16> {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        let w = workers
            .iter_mut()
            .enumerate()
            .min_by_key(|(i, w)| (w.assigned, *i))
            .map(|(_, w)| w)?;
        w.assigned += 1;
        Some(w.port)
    }

    pub fn len(&self) -> usize {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<WorkerInfo> {
        self.workers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|w| WorkerInfo {
                port: w.port,
                assigned: w.assigned,
                pid: w.child.as_ref().and_then(|c| c.id()),
            })
            .collect()
    }

    /// Sends a kill to every spawned worker. Externally managed workers are left alone.
    pub fn kill_workers(&self) {
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for w in workers.iter_mut() {
            let Some(child) = w.child.as_mut() else {
                continue;
            };
            if let Err(err) = child.start_kill() {
                tracing::debug!(port = w.port, err = %err, "balancer: kill worker failed");
            }
        }
    }
}

#[derive(Debug, Clone)]
pub struct BalancerOptions {
    pub listen_addr: String,
    pub transport: String,
    pub tls: TlsListenOptions,
}

impl Default for BalancerOptions {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:1435".into(),
            transport: "tls".into(),
            tls: TlsListenOptions::default(),
        }
    }
}

pub struct Balancer {
    pool: Arc<WorkerPool>,
    ln: Box<dyn TransportListener>,
    listen_addr: String,
}

impl Balancer {
    pub async fn bind(opts: BalancerOptions, pool: Arc<WorkerPool>) -> anyhow::Result<Self> {
        let tr = transport_by_name(&opts.transport)?;
        let ln = tr
            .listen(&opts.listen_addr, TransportListenOptions { tls: opts.tls })
            .await
            .with_context(|| format!("balancer: bind {}", opts.listen_addr))?;
        Ok(Self {
            pool,
            ln,
            listen_addr: opts.listen_addr,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.ln.local_addr()
    }

    pub async fn listen_and_serve(
        opts: BalancerOptions,
        pool: Arc<WorkerPool>,
        shutdown: watch::Receiver<bool>,
    ) -> anyhow::Result<()> {
        Self::bind(opts, pool).await?.serve(shutdown).await
    }

    pub async fn serve(self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        tracing::info!(addr = %self.listen_addr, local = ?self.local_addr(), workers = self.pool.len(), "balancer: listening");
        if self.pool.is_empty() {
            tracing::warn!("balancer: worker pool is empty; tunnel requests will be dropped");
        }
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
                            tracing::warn!(err = %err, "balancer: accept failed");
                            tokio::time::sleep(Duration::from_millis(50)).await;
                            continue;
                        }
                    };
                    let pool = self.pool.clone();
                    tokio::spawn(async move {
                        handle_conn(pool, accepting, peer).await;
                    });
                }
            }
        }
        self.pool.kill_workers();
        tracing::info!("balancer: stopped");
        Ok(())
    }
}

async fn handle_conn(pool: Arc<WorkerPool>, accepting: Accepting, peer: SocketAddr) {
    let stream = match accepting.await {
        Ok(s) => s,
        Err(err) => {
            tracing::debug!(client = %peer, err = %err, "balancer: handshake failed");
            return;
        }
    };
    let mut handler = ProtocolHandler::new(stream);

    match tokio::time::timeout(FIRST_PACKET_TIMEOUT, handler.recv()).await {
        Ok(Ok(Packet::TunnelRequest(_))) => match pool.assign() {
            Some(port) => {
                tracing::debug!(client = %peer, port, "balancer: assigned worker");
                let resp = Packet::LoadbalanceResponse(LoadbalanceResponse { new_port: port });
                if let Err(err) = handler.send(&resp).await {
                    tracing::debug!(client = %peer, err = %err, "balancer: reply failed");
                }
            }
            None => tracing::warn!(client = %peer, "balancer: no workers available"),
        },
        Ok(Ok(other)) => {
            tracing::debug!(client = %peer, kind = %other.kind(), "balancer: unexpected first packet");
        }
        Ok(Err(err)) => tracing::debug!(client = %peer, err = %err, "balancer: bad first packet"),
        Err(_) => tracing::debug!(client = %peer, "balancer: first packet timeout"),
    }
    handler.close().await;
}

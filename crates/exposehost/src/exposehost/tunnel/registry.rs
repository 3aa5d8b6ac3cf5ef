use std::sync::Arc;

use dashmap::{DashMap, mapref::entry::Entry};
use rand::{RngExt, rng};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::exposehost::tunnel::{
    codec::TunnelProtocol, error::TunnelError, forwarder::Forwarder, session::SessionEvent,
};

/// Random lowercase hex string of `len` characters.
pub fn random_hex(len: usize) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut r = rng();
    (0..len)
        .map(|_| HEX[r.random_range(0..HEX.len())] as char)
        .collect()
}

/// Hostnames claimed by the live sessions of one worker.
#[derive(Debug, Default)]
pub struct HostnameRegistry {
    hosts: DashMap<String, String>,
}

impl HostnameRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims `hostname` for `session_id`. Check and insert happen under one shard lock,
    /// so two sessions racing for the same name cannot both win.
    pub fn claim(&self, hostname: &str, session_id: &str) -> Result<(), TunnelError> {
        match self.hosts.entry(hostname.to_string()) {
            Entry::Occupied(_) => Err(TunnelError::SubdomainConflict(hostname.to_string())),
            Entry::Vacant(v) => {
                v.insert(session_id.to_string());
                Ok(())
            }
        }
    }

    /// Releases `hostname` if `session_id` still owns it.
    pub fn release(&self, hostname: &str, session_id: &str) -> bool {
        self.hosts
            .remove_if(hostname, |_, owner| owner == session_id)
            .is_some()
    }

    #[cfg(test)]
    pub fn contains(&self, hostname: &str) -> bool {
        self.hosts.contains_key(hostname)
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.hosts.len()
    }

    #[cfg(test)]
    pub fn is_empty(&self) -> bool {
        self.hosts.is_empty()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct TunnelInfo {
    pub id: String,
    pub client: String,
    pub hostname: String,
    pub protocol: TunnelProtocol,
    pub public_port: u16,
    pub url: String,
    pub started_at_unix_ms: u64,
}

struct SessionEntry {
    info: TunnelInfo,
    forwarder: Arc<Forwarder>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

/// Active control sessions of one worker, keyed by session id.
#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<String, SessionEntry>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(
        &self,
        info: TunnelInfo,
        forwarder: Arc<Forwarder>,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) {
        self.sessions.insert(
            info.id.clone(),
            SessionEntry {
                info,
                forwarder,
                events,
            },
        );
    }

    pub fn remove(&self, id: &str) {
        self.sessions.remove(id);
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Finds the forwarder holding a pairing that waits for `connection_id`.
    pub fn forwarder_for(&self, connection_id: &str) -> Option<Arc<Forwarder>> {
        self.sessions
            .iter()
            .find(|e| e.forwarder.is_awaiting(connection_id))
            .map(|e| e.forwarder.clone())
    }

    /// Asks every session to tear itself down. Sessions deregister on their own.
    pub fn kill_all(&self, reason: &str) {
        for e in self.sessions.iter() {
            let _ = e.events.send(SessionEvent::Kill(reason.to_string()));
        }
    }

    pub fn snapshot(&self) -> Vec<TunnelInfo> {
        let mut out: Vec<TunnelInfo> = self.sessions.iter().map(|e| e.info.clone()).collect();
        out.sort_by(|a, b| a.started_at_unix_ms.cmp(&b.started_at_unix_ms));
        out
    }
}

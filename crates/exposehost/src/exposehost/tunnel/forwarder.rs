//! Public side of one tunnel.
//!
//! A [`Forwarder`] owns the public listener of a session. Every public connection
//! becomes a pairing that waits for the client to dial back with the matching
//! connection id; once the callback stream arrives the two are relayed until both
//! directions finish.

use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        Arc, Mutex, PoisonError, Weak,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::AsyncWriteExt,
    net::{TcpListener, TcpStream},
    sync::{mpsc, oneshot},
    task::AbortHandle,
};

use crate::exposehost::tunnel::{
    codec::PAIRING_ACK,
    error::TunnelError,
    registry::random_hex,
    relay,
    session::SessionEvent,
    transport::BoxedStream,
};

pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PairingState {
    AwaitingHost,
    Paired,
}

struct PendingPairing {
    state: PairingState,
    host_tx: Option<oneshot::Sender<BoxedStream>>,
    task: AbortHandle,
}

pub struct Forwarder {
    port: u16,
    callback_timeout: Duration,
    events: mpsc::UnboundedSender<SessionEvent>,
    pairings: Mutex<HashMap<String, PendingPairing>>,
    accept_task: Mutex<Option<AbortHandle>>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for Forwarder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Forwarder")
            .field("port", &self.port)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl Forwarder {
    /// Binds a public listener on an ephemeral port of `bind_host` and starts accepting.
    pub async fn start(
        bind_host: &str,
        events: mpsc::UnboundedSender<SessionEvent>,
        callback_timeout: Duration,
    ) -> Result<Arc<Self>, TunnelError> {
        let host = bind_host.trim();
        let addr = if host.contains(':') {
            format!("[{host}]:0")
        } else {
            format!("{host}:0")
        };
        let ln = TcpListener::bind(&addr).await?;
        let port = ln.local_addr()?.port();

        let fwd = Arc::new(Self {
            port,
            callback_timeout,
            events,
            pairings: Mutex::new(HashMap::new()),
            accept_task: Mutex::new(None),
            stopped: AtomicBool::new(false),
        });

        let task = tokio::spawn(accept_loop(Arc::downgrade(&fwd), ln));
        *fwd.accept_task.lock().unwrap_or_else(PoisonError::into_inner) = Some(task.abort_handle());

        tracing::debug!(port, "forwarder: listening");
        Ok(fwd)
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.lock_pairings().len()
    }

    pub fn is_awaiting(&self, connection_id: &str) -> bool {
        self.lock_pairings()
            .get(connection_id)
            .is_some_and(|p| p.state == PairingState::AwaitingHost)
    }

    /// Hands the callback stream for `connection_id` to its waiting public connection.
    ///
    /// Fails, dropping `host`, unless that pairing is still waiting for its host.
    pub fn attach_host(&self, connection_id: &str, host: BoxedStream) -> Result<(), TunnelError> {
        let mut pairings = self.lock_pairings();
        let Some(p) = pairings.get_mut(connection_id) else {
            return Err(TunnelError::UnknownConnection(connection_id.to_string()));
        };
        if p.state != PairingState::AwaitingHost {
            return Err(TunnelError::UnknownConnection(connection_id.to_string()));
        }
        let Some(tx) = p.host_tx.take() else {
            return Err(TunnelError::UnknownConnection(connection_id.to_string()));
        };
        p.state = PairingState::Paired;
        tx.send(host)
            .map_err(|_| TunnelError::UnknownConnection(connection_id.to_string()))
    }

    /// Closes the listener and drops every public connection, paired or not. Idempotent.
    pub fn stop(&self) {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(task) = self
            .accept_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            task.abort();
        }
        let drained: Vec<PendingPairing> = self.lock_pairings().drain().map(|(_, p)| p).collect();
        let n = drained.len();
        for p in drained {
            p.task.abort();
        }
        tracing::debug!(port = self.port, aborted = n, "forwarder: stopped");
    }

    fn lock_pairings(&self) -> std::sync::MutexGuard<'_, HashMap<String, PendingPairing>> {
        self.pairings.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn on_public(self: &Arc<Self>, public: TcpStream, peer: SocketAddr) {
        let connection_id = random_hex(32);
        let (host_tx, host_rx) = oneshot::channel();

        {
            let mut pairings = self.lock_pairings();
            if self.is_stopped() {
                return;
            }
            let task = tokio::spawn(run_pairing(
                Arc::downgrade(self),
                connection_id.clone(),
                public,
                host_rx,
            ));
            pairings.insert(
                connection_id.clone(),
                PendingPairing {
                    state: PairingState::AwaitingHost,
                    host_tx: Some(host_tx),
                    task: task.abort_handle(),
                },
            );
        }

        tracing::debug!(port = self.port, client = %peer, connection_id = %connection_id, "forwarder: public connection");
        // A closed session channel means teardown is already underway; the pairing
        // then ends with the callback timeout or with `stop`.
        let _ = self.events.send(SessionEvent::NewConnection(connection_id));
    }

    fn finish_pairing(&self, connection_id: &str) {
        self.lock_pairings().remove(connection_id);
    }
}

impl Drop for Forwarder {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn accept_loop(fwd: Weak<Forwarder>, ln: TcpListener) {
    loop {
        let res = ln.accept().await;
        let Some(fwd) = fwd.upgrade() else {
            return;
        };
        match res {
            Ok((conn, peer)) => {
                let _ = conn.set_nodelay(true);
                fwd.on_public(conn, peer);
            }
            Err(err) => {
                tracing::warn!(port = fwd.port, err = %err, "forwarder: accept failed");
                drop(fwd);
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

/// `Ok(None)` means the forwarder stopped and dropped the sender.
async fn wait_for_host(
    timeout: Duration,
    host_rx: oneshot::Receiver<BoxedStream>,
    connection_id: &str,
) -> Result<Option<BoxedStream>, TunnelError> {
    match tokio::time::timeout(timeout, host_rx).await {
        Ok(Ok(host)) => Ok(Some(host)),
        Ok(Err(_)) => Ok(None),
        Err(_) => Err(TunnelError::CallbackTimeout(connection_id.to_string())),
    }
}

async fn run_pairing(
    fwd: Weak<Forwarder>,
    connection_id: String,
    public: TcpStream,
    host_rx: oneshot::Receiver<BoxedStream>,
) {
    let (timeout, port) = match fwd.upgrade() {
        Some(f) => (f.callback_timeout, f.port),
        None => return,
    };

    let mut host = match wait_for_host(timeout, host_rx, &connection_id).await {
        Ok(Some(host)) => host,
        Ok(None) => return,
        Err(err) => {
            drop(public);
            metrics::counter!("exposehost_callback_timeouts_total").increment(1);
            tracing::warn!(port, err = %err, "forwarder: pairing abandoned");
            if let Some(f) = fwd.upgrade() {
                f.finish_pairing(&connection_id);
                f.stop();
                let _ = f.events.send(SessionEvent::CallbackTimeout(connection_id));
            }
            return;
        }
    };

    metrics::counter!("exposehost_pairings_total").increment(1);

    let ack = async {
        host.write_all(&[PAIRING_ACK]).await?;
        host.flush().await
    };
    if let Err(err) = ack.await {
        tracing::debug!(port, connection_id = %connection_id, err = %err, "forwarder: ack write failed");
        if let Some(f) = fwd.upgrade() {
            f.finish_pairing(&connection_id);
        }
        return;
    }

    match relay::relay(public, host).await {
        Ok((ingress, egress)) => {
            metrics::counter!("exposehost_bytes_ingress_total").increment(ingress);
            metrics::counter!("exposehost_bytes_egress_total").increment(egress);
            tracing::debug!(port, connection_id = %connection_id, ingress, egress, "forwarder: pairing closed");
        }
        Err(err) => {
            tracing::debug!(port, connection_id = %connection_id, err = %err, "forwarder: pairing ended with error");
        }
    }

    if let Some(f) = fwd.upgrade() {
        f.finish_pairing(&connection_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncReadExt;

    async fn next_new_connection(rx: &mut mpsc::UnboundedReceiver<SessionEvent>) -> String {
        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SessionEvent::NewConnection(id))) => id,
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[tokio::test]
    async fn pairs_public_with_callback_and_relays() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fwd = Forwarder::start("127.0.0.1", tx, Duration::from_secs(5))
            .await
            .unwrap();
        assert_ne!(fwd.port(), 0);

        let mut public = TcpStream::connect(("127.0.0.1", fwd.port())).await.unwrap();
        let id = next_new_connection(&mut rx).await;
        assert_eq!(id.len(), 32);
        assert!(fwd.is_awaiting(&id));

        let (server_side, mut host) = tokio::io::duplex(1024);
        fwd.attach_host(&id, Box::new(server_side)).unwrap();
        assert!(!fwd.is_awaiting(&id));

        let mut ack = [0u8; 1];
        host.read_exact(&mut ack).await.unwrap();
        assert_eq!(ack[0], PAIRING_ACK);

        public.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        host.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        host.write_all(b"pong").await.unwrap();
        public.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");
    }

    #[tokio::test]
    async fn attach_rejects_unknown_and_repeated_ids() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fwd = Forwarder::start("127.0.0.1", tx, Duration::from_secs(5))
            .await
            .unwrap();

        let (a, _a) = tokio::io::duplex(64);
        assert!(matches!(
            fwd.attach_host("nope", Box::new(a)),
            Err(TunnelError::UnknownConnection(_))
        ));

        let _public = TcpStream::connect(("127.0.0.1", fwd.port())).await.unwrap();
        let id = next_new_connection(&mut rx).await;
        let (b, _b) = tokio::io::duplex(64);
        fwd.attach_host(&id, Box::new(b)).unwrap();
        let (c, _c) = tokio::io::duplex(64);
        assert!(fwd.attach_host(&id, Box::new(c)).is_err());
    }

    #[tokio::test]
    async fn callback_timeout_closes_public_and_stops_forwarder() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fwd = Forwarder::start("127.0.0.1", tx, Duration::from_millis(100))
            .await
            .unwrap();

        let mut public = TcpStream::connect(("127.0.0.1", fwd.port())).await.unwrap();
        let id = next_new_connection(&mut rx).await;

        match tokio::time::timeout(Duration::from_secs(2), rx.recv()).await {
            Ok(Some(SessionEvent::CallbackTimeout(got))) => assert_eq!(got, id),
            other => panic!("unexpected: {other:?}"),
        }

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), public.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0, "public connection should be closed");

        assert!(fwd.is_stopped());
        assert_eq!(fwd.pending_count(), 0);
    }

    #[tokio::test]
    async fn host_wait_reports_timeout_and_stop() {
        let (_tx, rx) = oneshot::channel::<BoxedStream>();
        match wait_for_host(Duration::from_millis(20), rx, "abc").await {
            Err(TunnelError::CallbackTimeout(id)) => assert_eq!(id, "abc"),
            other => panic!("unexpected: {:?}", other.map(|h| h.is_some())),
        }

        let (tx, rx) = oneshot::channel::<BoxedStream>();
        drop(tx);
        assert!(matches!(
            wait_for_host(Duration::from_secs(1), rx, "abc").await,
            Ok(None)
        ));
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_drops_public_connections() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let fwd = Forwarder::start("127.0.0.1", tx, Duration::from_secs(30))
            .await
            .unwrap();
        let port = fwd.port();

        let mut public = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
        let _ = next_new_connection(&mut rx).await;
        assert_eq!(fwd.pending_count(), 1);

        fwd.stop();
        fwd.stop();
        assert!(fwd.is_stopped());
        assert_eq!(fwd.pending_count(), 0);

        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(2), public.read(&mut buf))
            .await
            .unwrap()
            .unwrap_or(0);
        assert_eq!(n, 0);

        // The listener is gone once the accept task has been dropped.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(TcpStream::connect(("127.0.0.1", port)).await.is_err());
    }
}

use std::{net::SocketAddr, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Serialize;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::exposehost::{
    telemetry,
    tunnel::{
        balancer::{WorkerInfo, WorkerPool},
        client::{ClientControl, ClientSnapshot},
        registry::TunnelInfo,
        server::WorkerState,
    },
};

/// Read-only views over whatever roles this process runs.
#[derive(Clone)]
pub struct AdminState {
    pub prom: telemetry::SharedPrometheusHandle,
    pub worker: Option<Arc<WorkerState>>,
    pub pool: Option<Arc<WorkerPool>>,
    pub client: Option<ClientControl>,
}

fn router(state: AdminState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics))
        .route("/tunnels", get(tunnels))
        .route("/workers", get(workers))
        .route("/client", get(client))
        .route("/client/forward/{port}", post(client_forward))
        .with_state(Arc::new(state))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

pub async fn serve_with_shutdown(
    addr: SocketAddr,
    state: AdminState,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!(admin_addr = %addr, "admin: listening");
    serve_listener(listener, state, shutdown).await
}

async fn serve_listener(
    listener: TcpListener,
    state: AdminState,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            while !*shutdown.borrow() {
                if shutdown.changed().await.is_err() {
                    break;
                }
            }
        })
        .await?;

    Ok(())
}

#[derive(Debug, Serialize)]
struct HealthResponse {
    ok: bool,
    tunnels: usize,
    workers: usize,
}

async fn health(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    let tunnels = st.worker.as_ref().map_or(0, |w| w.sessions.len());
    let workers = st.pool.as_ref().map_or(0, |p| p.len());
    (
        StatusCode::OK,
        Json(HealthResponse {
            ok: true,
            tunnels,
            workers,
        }),
    )
}

async fn metrics(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        st.prom.render(),
    )
}

async fn tunnels(State(st): State<Arc<AdminState>>) -> Json<Vec<TunnelInfo>> {
    Json(
        st.worker
            .as_ref()
            .map(|w| w.sessions.snapshot())
            .unwrap_or_default(),
    )
}

async fn workers(State(st): State<Arc<AdminState>>) -> Json<Vec<WorkerInfo>> {
    Json(st.pool.as_ref().map(|p| p.snapshot()).unwrap_or_default())
}

async fn client(State(st): State<Arc<AdminState>>) -> impl IntoResponse {
    match &st.client {
        Some(c) => (StatusCode::OK, Json(Some(ClientSnapshot::clone(&c.snapshot())))),
        None => (StatusCode::NOT_FOUND, Json(None)),
    }
}

#[derive(Debug, Serialize)]
struct ForwardResponse {
    forwarded_port: u16,
}

/// Hook for a login proxy in front of the local service: later callbacks dial `port`.
async fn client_forward(State(st): State<Arc<AdminState>>, Path(port): Path<u16>) -> Response {
    let Some(c) = &st.client else {
        return StatusCode::NOT_FOUND.into_response();
    };
    if port == 0 {
        return StatusCode::BAD_REQUEST.into_response();
    }
    if !c.forward_port(port) {
        return StatusCode::GONE.into_response();
    }
    tracing::info!(port, "admin: client forward port changed");
    (
        StatusCode::OK,
        Json(ForwardResponse {
            forwarded_port: port,
        }),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use metrics_exporter_prometheus::PrometheusBuilder;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;
    use crate::exposehost::tunnel::{
        client::{Client, ClientHandle, ClientOptions, ClientStatus},
        codec::TunnelProtocol,
        edge::LogEdgeRouter,
        server::{Server, WorkerOptions},
        transport::TlsDialOptions,
    };

    async fn start_admin(client: Option<ClientControl>) -> (SocketAddr, watch::Sender<bool>) {
        let state = AdminState {
            prom: Arc::new(PrometheusBuilder::new().build_recorder().handle()),
            worker: None,
            pool: None,
            client,
        };
        let ln = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = ln.local_addr().unwrap();
        let (tx, rx) = watch::channel(false);
        tokio::spawn(serve_listener(ln, state, rx));
        (addr, tx)
    }

    async fn http(addr: SocketAddr, method: &str, path: &str) -> String {
        let mut c = tokio::net::TcpStream::connect(addr).await.unwrap();
        let req = format!(
            "{method} {path} HTTP/1.1\r\nHost: admin\r\nContent-Length: 0\r\nConnection: close\r\n\r\n"
        );
        c.write_all(req.as_bytes()).await.unwrap();
        let mut out = String::new();
        tokio::time::timeout(Duration::from_secs(5), c.read_to_string(&mut out))
            .await
            .unwrap()
            .unwrap();
        out
    }

    async fn connected_client() -> (ClientHandle, watch::Sender<bool>) {
        let srv = Server::bind(
            WorkerOptions {
                listen_addr: "127.0.0.1:0".into(),
                transport: "tcp".into(),
                public_bind_host: "127.0.0.1".into(),
                ..Default::default()
            },
            Arc::new(LogEdgeRouter),
        )
        .await
        .unwrap();
        let port = srv.local_addr().unwrap().port();
        let (stop, rx) = watch::channel(false);
        tokio::spawn(srv.serve(rx));

        let h = Client::start(ClientOptions {
            server_addr: format!("127.0.0.1:{port}"),
            transport: "tcp".into(),
            tls: TlsDialOptions::default(),
            auth_token: String::new(),
            subdomain: "admin-demo".into(),
            protocol: TunnelProtocol::Tcp,
            local_addr: "127.0.0.1:8000".into(),
            dial_timeout: Duration::from_secs(2),
        })
        .unwrap();
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.snapshot().status != ClientStatus::Connected {
            assert!(tokio::time::Instant::now() < deadline, "{:?}", h.snapshot().last_error);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        (h, stop)
    }

    #[tokio::test]
    async fn forward_route_retargets_the_client() {
        let (h, _worker) = connected_client().await;
        let (addr, _stop) = start_admin(Some(h.control())).await;

        let resp = http(addr, "POST", "/client/forward/8123").await;
        assert!(resp.starts_with("HTTP/1.1 200"), "{resp}");
        assert!(resp.contains("\"forwarded_port\":8123"), "{resp}");

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while h.snapshot().forwarded_port != 8123 {
            assert!(tokio::time::Instant::now() < deadline);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let resp = http(addr, "GET", "/client").await;
        assert!(resp.contains("\"status\":\"connected\""), "{resp}");

        let resp = http(addr, "POST", "/client/forward/0").await;
        assert!(resp.starts_with("HTTP/1.1 400"), "{resp}");
    }

    #[tokio::test]
    async fn client_routes_without_a_client() {
        let (addr, _stop) = start_admin(None).await;
        assert!(http(addr, "POST", "/client/forward/8123").await.starts_with("HTTP/1.1 404"));
        assert!(http(addr, "GET", "/client").await.starts_with("HTTP/1.1 404"));
        assert!(http(addr, "GET", "/health").await.starts_with("HTTP/1.1 200"));
    }
}

//! HTTP transport: `http://host:port/path`.
//!
//! Each connection is a single streaming exchange. The client opens a POST
//! whose request body carries client-to-server messages; the server answers
//! at once with `200 OK` and a response body that carries server-to-client
//! messages for as long as the exchange lives. The server also answers
//! `GET /health`.

use super::{ensure_scheme, host_port, ChannelHandler, Client, ClientFactory, Server, ServerFactory};
use crate::config::TransportConfig;
use crate::connection::{ByteSink, ByteStream, Connection, ConnectionHandle, ConnectionInfo};
use crate::events::EventEmitter;
use crate::{Result, RpcError};
use async_trait::async_trait;
use axum::body::Body;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use futures::sink;
use futures::stream::{self, Stream, StreamExt};
use serde_json::{json, Value};
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};
use url::Url;

const SCHEME: &str = "http";

pub struct HttpClientFactory;

impl ClientFactory for HttpClientFactory {
    fn name(&self) -> &'static str {
        SCHEME
    }

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Client>> {
        ensure_scheme(address, SCHEME)?;
        host_port(address)?;
        Ok(Box::new(HttpClient::new(address.clone(), handler)?))
    }
}

pub struct HttpServerFactory;

impl ServerFactory for HttpServerFactory {
    fn name(&self) -> &'static str {
        SCHEME
    }

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Server>> {
        ensure_scheme(address, SCHEME)?;
        host_port(address)?;
        if address.path() == TransportConfig::HTTP_HEALTH_PATH {
            return Err(RpcError::InvalidAddress {
                address: address.to_string(),
                message: format!("{} is reserved for health checks", TransportConfig::HTTP_HEALTH_PATH),
            });
        }
        Ok(Box::new(HttpServer::new(address.clone(), handler)))
    }
}

/// Writable half backed by a bounded channel of body chunks.
fn channel_sink(tx: mpsc::Sender<Bytes>) -> ByteSink {
    Box::pin(sink::unfold(tx, |tx, chunk: Bytes| async move {
        tx.send(chunk)
            .await
            .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "body stream closed"))?;
        Ok::<_, io::Error>(tx)
    }))
}

/// Body stream fed by [`channel_sink`]; ends once the sink is dropped.
fn channel_body(rx: mpsc::Receiver<Bytes>) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
    stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|chunk| (Ok(chunk), rx))
    })
}

/// Opens one streaming POST exchange.
pub struct HttpClient {
    address: Url,
    handler: Arc<dyn ChannelHandler>,
    http: reqwest::Client,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl HttpClient {
    pub fn new(address: Url, handler: Arc<dyn ChannelHandler>) -> Result<Self> {
        let http = reqwest::Client::builder()
            .connect_timeout(TransportConfig::CONNECT_TIMEOUT)
            .build()
            .map_err(|e| RpcError::Transport {
                address: address.to_string(),
                message: e.to_string(),
            })?;
        Ok(Self {
            address,
            handler,
            http,
            connection: Mutex::new(None),
        })
    }

    fn transport_error(&self, message: impl Into<String>) -> RpcError {
        RpcError::Transport {
            address: self.address.to_string(),
            message: message.into(),
        }
    }
}

#[async_trait]
impl Client for HttpClient {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel(TransportConfig::HTTP_BODY_CHANNEL_CAPACITY);
        let request = self
            .http
            .post(self.address.clone())
            .header(header::CONTENT_TYPE, TransportConfig::HTTP_CONTENT_TYPE)
            .body(reqwest::Body::wrap_stream(channel_body(rx)));

        let response = tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, request.send())
            .await
            .map_err(|_| self.transport_error("timed out waiting for response headers"))?
            .map_err(|e| self.transport_error(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(format!("unexpected status {}", status)));
        }

        let readable: ByteStream = response.bytes_stream().map(|r| r.map_err(io::Error::other)).boxed();
        let peer = self.address.host_str().map(|host| match self.address.port() {
            Some(port) => format!("{}:{}", host, port),
            None => host.to_string(),
        });
        let connection = Connection::new(readable, channel_sink(tx), ConnectionInfo::new(SCHEME, peer));
        debug!("Opened HTTP exchange with {}", self.address);

        let handle = connection.handle();
        self.handler.channel(connection).await?;
        if let Ok(mut slot) = self.connection.lock() {
            *slot = Some(handle);
        }
        Ok(())
    }

    fn close(&self) {
        if let Some(handle) = self.connection.lock().ok().and_then(|mut slot| slot.take()) {
            handle.close();
        }
    }
}

struct ExchangeState {
    handler: Arc<dyn ChannelHandler>,
    events: EventEmitter<ConnectionInfo>,
    conn_shutdown: watch::Receiver<bool>,
    active_connections: Arc<AtomicUsize>,
}

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    conn_shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Serves streaming exchanges on one path.
pub struct HttpServer {
    address: Url,
    handler: Arc<dyn ChannelHandler>,
    connections: EventEmitter<ConnectionInfo>,
    active_connections: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
}

impl HttpServer {
    pub fn new(address: Url, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            address,
            handler,
            connections: EventEmitter::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Exchanges currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    fn router(&self, state: Arc<ExchangeState>) -> Router {
        let path = match self.address.path() {
            "" => "/",
            path => path,
        };
        Router::new()
            .route(TransportConfig::HTTP_HEALTH_PATH, get(handle_health))
            .route(path, post(handle_exchange))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }
}

/// Health check endpoint.
async fn handle_health() -> Json<Value> {
    Json(json!({"status": "ok"}))
}

async fn handle_exchange(
    State(state): State<Arc<ExchangeState>>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    body: Body,
) -> Response {
    let current = state.active_connections.load(Ordering::Relaxed);
    if current >= TransportConfig::MAX_CONNECTIONS {
        warn!(
            "Rejecting HTTP exchange from {}: at max capacity ({})",
            peer,
            TransportConfig::MAX_CONNECTIONS
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let readable: ByteStream = body
        .into_data_stream()
        .map(|r| r.map_err(io::Error::other))
        .boxed();
    let (tx, rx) = mpsc::channel(TransportConfig::HTTP_BODY_CHANNEL_CAPACITY);
    let connection = Connection::new(
        readable,
        channel_sink(tx),
        ConnectionInfo::new(SCHEME, Some(peer.to_string())),
    );
    let info = connection.info().clone();
    let handle = connection.handle();

    if let Err(e) = state.handler.channel(connection).await {
        warn!("Handler rejected exchange {}: {}", info, e);
        handle.close();
        return (StatusCode::SERVICE_UNAVAILABLE, e.to_string()).into_response();
    }
    debug!("HTTP exchange from {}", peer);
    state.events.emit(info.clone());

    state.active_connections.fetch_add(1, Ordering::Relaxed);
    let conns = state.active_connections.clone();
    let mut conn_shutdown = state.conn_shutdown.clone();
    tokio::spawn(async move {
        tokio::select! {
            _ = handle.closed() => {}
            _ = conn_shutdown.wait_for(|stop| *stop) => {
                handle.close();
            }
        }
        conns.fetch_sub(1, Ordering::Relaxed);
        debug!("HTTP exchange {} ended", info);
    });

    (
        [(header::CONTENT_TYPE, TransportConfig::HTTP_CONTENT_TYPE)],
        Body::from_stream(channel_body(rx)),
    )
        .into_response()
}

#[async_trait]
impl Server for HttpServer {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn listen(&self) -> Result<Url> {
        if self.running.lock().map(|r| r.is_some()).unwrap_or(false) {
            return Err(RpcError::Transport {
                address: self.address.to_string(),
                message: "already listening".to_string(),
            });
        }

        let (host, port) = host_port(&self.address)?;
        let listener = TcpListener::bind((host.as_str(), port))
            .await
            .map_err(|e| RpcError::Transport {
                address: self.address.to_string(),
                message: e.to_string(),
            })?;
        let local = listener.local_addr()?;
        let mut bound = self.address.clone();
        bound
            .set_ip_host(local.ip())
            .and_then(|_| bound.set_port(Some(local.port())))
            .map_err(|_| RpcError::InvalidAddress {
                address: self.address.to_string(),
                message: "cannot report bound address".to_string(),
            })?;
        info!("HTTP server listening on {}", bound);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);
        let state = Arc::new(ExchangeState {
            handler: self.handler.clone(),
            events: self.connections.clone(),
            conn_shutdown: conn_shutdown_rx,
            active_connections: self.active_connections.clone(),
        });
        let app = self.router(state);

        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
                .with_graceful_shutdown(async move {
                    let _ = shutdown_rx.await;
                    info!("HTTP server shutting down");
                });
            if let Err(e) = serve.await {
                error!("HTTP server error: {}", e);
            }
        });

        if let Ok(mut running) = self.running.lock() {
            *running = Some(Running {
                shutdown_tx,
                conn_shutdown_tx,
                task,
            });
        }
        Ok(bound)
    }

    async fn close(&self) {
        let running = self.running.lock().ok().and_then(|mut r| r.take());
        let Some(running) = running else {
            return;
        };
        let _ = running.shutdown_tx.send(());
        let _ = running.conn_shutdown_tx.send(true);
        let mut task = running.task;
        // Graceful shutdown waits on peers that keep their request open.
        if tokio::time::timeout(TransportConfig::CONNECT_TIMEOUT, &mut task)
            .await
            .is_err()
        {
            warn!("HTTP server did not drain in time; aborting");
            task.abort();
        }
    }

    fn connections(&self) -> &EventEmitter<ConnectionInfo> {
        &self.connections
    }
}

impl Drop for HttpServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().ok().and_then(|r| r.take()) {
            let _ = running.shutdown_tx.send(());
            let _ = running.conn_shutdown_tx.send(true);
            running.task.abort();
        }
    }
}

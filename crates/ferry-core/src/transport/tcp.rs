//! Raw TCP transport: `tcp://host:port`.
//!
//! The server accepts connections in a background task and hands each to
//! the channel handler. Closing the server stops the accept loop and signals
//! every live connection to close.

use super::{ensure_scheme, host_port, ChannelHandler, Client, ClientFactory, Server, ServerFactory};
use crate::config::TransportConfig;
use crate::connection::{Connection, ConnectionHandle, ConnectionInfo};
use crate::events::EventEmitter;
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use url::Url;

const SCHEME: &str = "tcp";

pub struct TcpClientFactory;

impl ClientFactory for TcpClientFactory {
    fn name(&self) -> &'static str {
        SCHEME
    }

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Client>> {
        ensure_scheme(address, SCHEME)?;
        host_port(address)?;
        Ok(Box::new(TcpClient::new(address.clone(), handler)))
    }
}

pub struct TcpServerFactory;

impl ServerFactory for TcpServerFactory {
    fn name(&self) -> &'static str {
        SCHEME
    }

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Server>> {
        ensure_scheme(address, SCHEME)?;
        host_port(address)?;
        Ok(Box::new(TcpServer::new(address.clone(), handler)))
    }
}

/// Connects once and hands the stream to the handler.
pub struct TcpClient {
    address: Url,
    handler: Arc<dyn ChannelHandler>,
    connection: Mutex<Option<ConnectionHandle>>,
}

impl TcpClient {
    pub fn new(address: Url, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            address,
            handler,
            connection: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Client for TcpClient {
    fn address(&self) -> &Url {
        &self.address
    }

    async fn connect(&self) -> Result<()> {
        let (host, port) = host_port(&self.address)?;
        let stream = tokio::time::timeout(
            TransportConfig::CONNECT_TIMEOUT,
            TcpStream::connect((host.as_str(), port)),
        )
        .await
        .map_err(|_| RpcError::Transport {
            address: self.address.to_string(),
            message: format!("connect timed out after {:?}", TransportConfig::CONNECT_TIMEOUT),
        })?
        .map_err(|e| RpcError::Transport {
            address: self.address.to_string(),
            message: e.to_string(),
        })?;
        let _ = stream.set_nodelay(true);

        let connection = Connection::from_tcp(stream);
        debug!("Connected to {}", connection.info());
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

struct Running {
    shutdown_tx: oneshot::Sender<()>,
    conn_shutdown_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

/// Accepts connections until closed.
pub struct TcpServer {
    address: Url,
    handler: Arc<dyn ChannelHandler>,
    connections: EventEmitter<ConnectionInfo>,
    active_connections: Arc<AtomicUsize>,
    running: Mutex<Option<Running>>,
}

impl TcpServer {
    pub fn new(address: Url, handler: Arc<dyn ChannelHandler>) -> Self {
        Self {
            address,
            handler,
            connections: EventEmitter::new(),
            active_connections: Arc::new(AtomicUsize::new(0)),
            running: Mutex::new(None),
        }
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        self.active_connections.load(Ordering::Relaxed)
    }

    async fn accept_loop(
        listener: TcpListener,
        handler: Arc<dyn ChannelHandler>,
        events: EventEmitter<ConnectionInfo>,
        mut shutdown_rx: oneshot::Receiver<()>,
        conn_shutdown_rx: watch::Receiver<bool>,
        active_connections: Arc<AtomicUsize>,
    ) {
        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("TCP server shutting down");
                    break;
                }
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer_addr)) => {
                            let current = active_connections.load(Ordering::Relaxed);
                            if current >= TransportConfig::MAX_CONNECTIONS {
                                warn!(
                                    "Rejecting TCP connection from {}: at max capacity ({})",
                                    peer_addr,
                                    TransportConfig::MAX_CONNECTIONS
                                );
                                continue;
                            }
                            let _ = stream.set_nodelay(true);

                            active_connections.fetch_add(1, Ordering::Relaxed);
                            let handler = handler.clone();
                            let events = events.clone();
                            let conns = active_connections.clone();
                            let conn_shutdown = conn_shutdown_rx.clone();

                            tokio::spawn(async move {
                                debug!("TCP connection from {}", peer_addr);
                                serve_connection(stream, handler, events, conn_shutdown).await;
                                conns.fetch_sub(1, Ordering::Relaxed);
                            });
                        }
                        Err(e) => {
                            error!("TCP accept error: {}", e);
                        }
                    }
                }
            }
        }
    }
}

/// Hand one accepted stream to the handler and hold it until either side
/// closes it or the server shuts down.
pub(crate) async fn serve_connection(
    stream: TcpStream,
    handler: Arc<dyn ChannelHandler>,
    events: EventEmitter<ConnectionInfo>,
    mut conn_shutdown: watch::Receiver<bool>,
) {
    let connection = Connection::from_tcp(stream);
    let info = connection.info().clone();
    let handle = connection.handle();

    if let Err(e) = handler.channel(connection).await {
        warn!("Handler rejected connection {}: {}", info, e);
        handle.close();
        return;
    }
    events.emit(info.clone());

    tokio::select! {
        _ = handle.closed() => {}
        _ = conn_shutdown.wait_for(|stop| *stop) => {
            handle.close();
        }
    }
    debug!("TCP connection {} ended", info);
}

#[async_trait]
impl Server for TcpServer {
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
        let bound = super::parse_address(&format!("{}://{}", SCHEME, local))?;
        info!("TCP server listening on {}", bound);

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let (conn_shutdown_tx, conn_shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(Self::accept_loop(
            listener,
            self.handler.clone(),
            self.connections.clone(),
            shutdown_rx,
            conn_shutdown_rx,
            self.active_connections.clone(),
        ));

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
        // Signal accept loop to stop
        let _ = running.shutdown_tx.send(());
        // Signal all connection handlers to close
        let _ = running.conn_shutdown_tx.send(true);
        let _ = running.task.await;
    }

    fn connections(&self) -> &EventEmitter<ConnectionInfo> {
        &self.connections
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().ok().and_then(|r| r.take()) {
            let _ = running.shutdown_tx.send(());
            let _ = running.conn_shutdown_tx.send(true);
            running.task.abort();
        }
    }
}

//! Transports: concrete byte-stream mechanisms selected by address scheme.
//!
//! A [`TransportRegistry`] holds ordered client and server factories. Each
//! factory inspects the address and either builds a [`Client`] or
//! [`Server`], or refuses with a reason. The first factory that accepts
//! wins.
//!
//! ```no_run
//! use ferry_core::{Endpoint, TransportRegistry};
//! use std::sync::Arc;
//!
//! # async fn demo() -> ferry_core::Result<()> {
//! let registry = TransportRegistry::with_defaults();
//! let endpoint = Endpoint::new();
//! let client = registry.create_client("tcp://127.0.0.1:4000", Arc::new(endpoint.clone()))?;
//! client.connect().await?;
//! let pong = endpoint.invoke("ping", vec![]).await?;
//! # Ok(())
//! # }
//! ```

pub mod http;
pub mod tcp;

pub use http::{HttpClientFactory, HttpServerFactory};
pub use tcp::{TcpClientFactory, TcpServerFactory};

use crate::connection::{Connection, ConnectionInfo};
use crate::events::EventEmitter;
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;
use url::Url;

/// Receives every connection a client or server establishes.
#[async_trait]
pub trait ChannelHandler: Send + Sync + 'static {
    async fn channel(&self, connection: Connection) -> Result<()>;
}

/// Connecting side of a transport.
#[async_trait]
pub trait Client: Send + Sync {
    fn address(&self) -> &Url;

    /// Establish the connection and hand it to the handler.
    async fn connect(&self) -> Result<()>;

    /// Close the established connection, if any.
    fn close(&self);
}

/// Listening side of a transport.
#[async_trait]
pub trait Server: Send + Sync {
    fn address(&self) -> &Url;

    /// Start accepting; returns the address actually bound.
    async fn listen(&self) -> Result<Url>;

    /// Stop accepting and close live connections.
    async fn close(&self);

    /// Fires with each accepted connection's details.
    fn connections(&self) -> &EventEmitter<ConnectionInfo>;
}

/// Builds clients for the addresses it understands.
pub trait ClientFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Client>>;
}

/// Builds servers for the addresses it understands.
pub trait ServerFactory: Send + Sync {
    fn name(&self) -> &'static str;

    fn create(&self, address: &Url, handler: Arc<dyn ChannelHandler>) -> Result<Box<dyn Server>>;
}

/// Ordered set of transport factories.
#[derive(Default, Clone)]
pub struct TransportRegistry {
    clients: Vec<Arc<dyn ClientFactory>>,
    servers: Vec<Arc<dyn ServerFactory>>,
}

impl TransportRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the TCP and HTTP transports.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register_client(Arc::new(TcpClientFactory));
        registry.register_client(Arc::new(HttpClientFactory));
        registry.register_server(Arc::new(TcpServerFactory));
        registry.register_server(Arc::new(HttpServerFactory));
        registry
    }

    pub fn register_client(&mut self, factory: Arc<dyn ClientFactory>) {
        self.clients.push(factory);
    }

    pub fn register_server(&mut self, factory: Arc<dyn ServerFactory>) {
        self.servers.push(factory);
    }

    pub fn create_client(
        &self,
        address: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Box<dyn Client>> {
        let url = parse_address(address)?;
        let mut reasons = Vec::new();
        for factory in &self.clients {
            match factory.create(&url, handler.clone()) {
                Ok(client) => {
                    debug!("Using {} client for {}", factory.name(), address);
                    return Ok(client);
                }
                Err(e) => reasons.push(format!("{}: {}", factory.name(), e)),
            }
        }
        Err(RpcError::NoSuitableFactory {
            kind: "client",
            address: address.to_string(),
            reasons,
        })
    }

    pub fn create_server(
        &self,
        address: &str,
        handler: Arc<dyn ChannelHandler>,
    ) -> Result<Box<dyn Server>> {
        let url = parse_address(address)?;
        let mut reasons = Vec::new();
        for factory in &self.servers {
            match factory.create(&url, handler.clone()) {
                Ok(server) => {
                    debug!("Using {} server for {}", factory.name(), address);
                    return Ok(server);
                }
                Err(e) => reasons.push(format!("{}: {}", factory.name(), e)),
            }
        }
        Err(RpcError::NoSuitableFactory {
            kind: "server",
            address: address.to_string(),
            reasons,
        })
    }
}

impl std::fmt::Debug for TransportRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportRegistry")
            .field(
                "clients",
                &self.clients.iter().map(|c| c.name()).collect::<Vec<_>>(),
            )
            .field(
                "servers",
                &self.servers.iter().map(|s| s.name()).collect::<Vec<_>>(),
            )
            .finish()
    }
}

pub(crate) fn parse_address(address: &str) -> Result<Url> {
    Url::parse(address).map_err(|e| RpcError::InvalidAddress {
        address: address.to_string(),
        message: e.to_string(),
    })
}

/// Refusal used by factories for schemes they do not handle.
pub(crate) fn ensure_scheme(address: &Url, scheme: &str) -> Result<()> {
    if address.scheme() == scheme {
        Ok(())
    } else {
        Err(RpcError::InvalidAddress {
            address: address.to_string(),
            message: format!("unsupported scheme '{}'", address.scheme()),
        })
    }
}

/// `host:port` of an address, which must name both.
pub(crate) fn host_port(address: &Url) -> Result<(String, u16)> {
    let host = address
        .host_str()
        .filter(|h| !h.is_empty())
        .ok_or_else(|| RpcError::InvalidAddress {
            address: address.to_string(),
            message: "missing host".to_string(),
        })?;
    let port = address
        .port_or_known_default()
        .ok_or_else(|| RpcError::InvalidAddress {
            address: address.to_string(),
            message: "missing port".to_string(),
        })?;
    // IPv6 literals come back bracketed; resolvers want them bare.
    let host = host.trim_start_matches('[').trim_end_matches(']').to_string();
    Ok((host, port))
}

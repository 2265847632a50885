//! One endpoint per accepted connection.

use crate::config::EndpointOptions;
use crate::connection::Connection;
use crate::endpoint::Endpoint;
use crate::events::EventEmitter;
use crate::provider::Provider;
use crate::transport::ChannelHandler;
use crate::value::{Method, Value};
use crate::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// Channel handler that serves many peers from one method template.
///
/// Every connection gets a fresh [`Endpoint`] whose provider is a fork of
/// the template, so callbacks exposed on one connection are invisible to the
/// others. Listeners on [`connected`](Service::connected) receive each new
/// endpoint, which is how a server calls back into its clients.
///
/// A function returned from a method is registered on that connection's
/// endpoint until the connection closes, so a method that hands out a fresh
/// function per call grows the connection's table by one entry per call.
/// Long-lived peers that call such methods in a loop should reconnect, or
/// the method should return a shared `Method` instead.
#[derive(Clone)]
pub struct Service {
    template: Provider,
    options: EndpointOptions,
    connected: EventEmitter<Endpoint>,
    active: Arc<AtomicUsize>,
}

impl Default for Service {
    fn default() -> Self {
        Self::new()
    }
}

impl Service {
    pub fn new() -> Self {
        Self::with_options(EndpointOptions::default())
    }

    pub fn with_options(options: EndpointOptions) -> Self {
        Self {
            template: Provider::new(),
            options,
            connected: EventEmitter::new(),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Methods copied into every new endpoint.
    pub fn provider(&self) -> &Provider {
        &self.template
    }

    pub fn expose(&self, method: Method, name: Option<&str>) -> Result<String> {
        self.template.expose(method, name)
    }

    pub fn expose_object(&self, prefix: &str, value: &Value) -> Result<Vec<String>> {
        self.template.expose_object(prefix, value)
    }

    pub fn connected(&self) -> &EventEmitter<Endpoint> {
        &self.connected
    }

    /// Endpoints currently bound and open.
    pub fn active_endpoints(&self) -> usize {
        self.active.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl ChannelHandler for Service {
    async fn channel(&self, connection: Connection) -> Result<()> {
        let endpoint = Endpoint::with_provider(self.template.fork(), self.options.clone());
        endpoint.bind(connection)?;

        self.active.fetch_add(1, Ordering::Relaxed);
        let active = self.active.clone();
        let watched = endpoint.clone();
        tokio::spawn(async move {
            watched.closed().await;
            active.fetch_sub(1, Ordering::Relaxed);
            debug!("Service endpoint closed");
        });

        self.connected.emit(endpoint);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    #[tokio::test]
    async fn test_each_connection_gets_its_own_endpoint() {
        let service = Service::new();
        service
            .expose(Method::sync(|_| Ok(Value::from("foo"))), Some("foo"))
            .unwrap();

        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = seen.clone();
        service.connected().on(move |endpoint: Endpoint| {
            s.lock().unwrap().push(endpoint);
        });

        let mut clients = Vec::new();
        for _ in 0..2 {
            let (left, right) = Connection::pair();
            service.channel(right).await.unwrap();
            let client = Endpoint::new();
            client.bind(left).unwrap();
            clients.push(client);
        }

        for client in &clients {
            assert_eq!(client.invoke("foo", vec![]).await.unwrap(), Value::from("foo"));
        }

        let endpoints = seen.lock().unwrap().clone();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(service.active_endpoints(), 2);

        // A callback exposed on one endpoint stays local to it.
        endpoints[0]
            .expose(Method::sync(|_| Ok(Value::Null)), Some("only-first"))
            .unwrap();
        assert!(!endpoints[1].provider().contains("only-first"));
        assert!(!service.provider().contains("only-first"));

        clients[0].close();
        tokio::time::timeout(Duration::from_secs(1), endpoints[0].closed())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while service.active_endpoints() != 1 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("closed endpoint should stop counting as active");
    }
}

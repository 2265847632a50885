//! Demo server: one endpoint per connection, any registered transport.

use crate::methods;
use ferry_core::{Server, Service, TransportRegistry};
use std::sync::Arc;
use tracing::info;
use url::Url;

/// Start serving the demo methods on `address`.
///
/// Returns the running server and the address it actually bound (useful
/// when the port is 0).
pub async fn start_server(
    registry: &TransportRegistry,
    address: &str,
) -> anyhow::Result<(Box<dyn Server>, Url)> {
    let service = Service::new();
    methods::register(&service)?;
    service.connected().on(|endpoint| {
        info!("Peer connected ({:?})", endpoint);
    });

    let server = registry.create_server(address, Arc::new(service))?;
    let bound = server.listen().await?;
    server.connections().on(|peer| {
        info!("Accepted {}", peer);
    });

    info!("Server listening on {}", bound);
    Ok((server, bound))
}

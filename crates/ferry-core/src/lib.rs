//! Ferry: bidirectional JSON-RPC with transparent function marshalling.
//!
//! Both peers of a connection are symmetric [`Endpoint`]s: each can expose
//! methods and invoke the other's. Functions passed as arguments or returned
//! as results cross the wire as references and are called back through the
//! same connection.
//!
//! # Architecture
//!
//! - [`protocol`] / [`codec`]: JSON-RPC 2.0 messages framed one per line
//! - [`consumer`]: outgoing invocations, correlated with replies by id
//! - [`provider`]: the exposed-method table
//! - [`marshal`]: functions <-> method references
//! - [`endpoint`]: consumer + provider bound to a [`Connection`]
//! - [`transport`]: TCP and HTTP connections selected by address scheme
//!
//! # Example
//!
//! ```no_run
//! use ferry_core::{Connection, Endpoint, Method, Value};
//!
//! # async fn demo() -> ferry_core::Result<()> {
//! let (left, right) = Connection::pair();
//! let server = Endpoint::new();
//! server.expose(
//!     Method::sync(|params| {
//!         let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
//!         Ok(Value::from(sum))
//!     }),
//!     Some("add"),
//! )?;
//! server.bind(right)?;
//!
//! let client = Endpoint::new();
//! client.bind(left)?;
//! let sum = client.invoke("add", vec![Value::from(23), Value::from(19)]).await?;
//! assert_eq!(sum, Value::from(42));
//! # Ok(())
//! # }
//! ```

pub mod codec;
pub mod config;
pub mod connection;
pub mod consumer;
pub mod endpoint;
pub mod error;
pub mod events;
pub mod marshal;
pub mod protocol;
pub mod provider;
pub mod service;
pub mod transport;
pub mod value;

pub use config::{CodecConfig, EndpointConfig, EndpointOptions, TransportConfig};
pub use connection::{ByteSink, ByteStream, Connection, ConnectionHandle, ConnectionInfo};
pub use consumer::Consumer;
pub use endpoint::Endpoint;
pub use error::{Result, RpcError};
pub use events::{EventEmitter, ListenerId};
pub use marshal::RemoteMethod;
pub use protocol::{ErrorCode, Id, Message, MethodReference, ProtocolError};
pub use provider::Provider;
pub use service::Service;
pub use transport::{
    ChannelHandler, Client, ClientFactory, Server, ServerFactory, TransportRegistry,
};
pub use value::{Callable, Method, Value};

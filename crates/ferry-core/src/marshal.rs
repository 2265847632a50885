//! Function marshalling.
//!
//! Outbound, every [`Value::Function`] is exposed on the local provider
//! under a generated name and replaced by a method reference. Inbound, every
//! method reference becomes a [`Value::Function`] backed by a
//! [`RemoteMethod`] that calls back through the local consumer.

use crate::consumer::{Consumer, ConsumerInner};
use crate::protocol::MethodReference;
use crate::provider::Provider;
use crate::value::{Callable, Method, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use std::sync::{Arc, Weak};

/// Stub for a function that lives on the peer.
pub struct RemoteMethod {
    consumer: Weak<ConsumerInner>,
    method: String,
}

impl RemoteMethod {
    /// Name the peer exposed the function under.
    pub fn method(&self) -> &str {
        &self.method
    }
}

#[async_trait]
impl Callable for RemoteMethod {
    async fn call(&self, params: Vec<Value>) -> Result<Value> {
        let inner = self.consumer.upgrade().ok_or(RpcError::ConnectionClosed)?;
        Consumer::from_inner(inner).invoke(&self.method, params).await
    }
}

/// Per-endpoint marshalling context.
pub(crate) struct Marshaller {
    provider: Provider,
    consumer: Weak<ConsumerInner>,
}

impl Marshaller {
    pub(crate) fn new(provider: Provider, consumer: Weak<ConsumerInner>) -> Self {
        Self { provider, consumer }
    }

    pub(crate) fn provider(&self) -> &Provider {
        &self.provider
    }

    /// Prepare a value for the wire.
    ///
    /// Names generated for non-persistent functions are appended to
    /// `scoped` so the caller can unexpose them when they are no longer
    /// reachable.
    pub(crate) fn outbound(
        &self,
        value: Value,
        scoped: &mut Vec<String>,
    ) -> Result<serde_json::Value> {
        Ok(match value {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(b),
            Value::Number(n) => serde_json::Value::Number(n),
            Value::String(s) => serde_json::Value::String(s),
            Value::Array(items) => serde_json::Value::Array(
                items
                    .into_iter()
                    .map(|item| self.outbound(item, scoped))
                    .collect::<Result<_>>()?,
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.into_iter()
                    .map(|(key, item)| Ok::<_, RpcError>((key, self.outbound(item, scoped)?)))
                    .collect::<Result<_>>()?,
            ),
            Value::Function(method) => {
                let persistent = method.is_persistent();
                let name = self.provider.expose_callback(method)?;
                if !persistent {
                    scoped.push(name.clone());
                }
                MethodReference::new(name).to_value()
            }
        })
    }

    /// Prepare a value received from the wire.
    pub(crate) fn inbound(&self, value: serde_json::Value) -> Value {
        if let Some(reference) = MethodReference::from_value(&value) {
            return Value::Function(Method::from_callable(Arc::new(RemoteMethod {
                consumer: self.consumer.clone(),
                method: reference.method,
            })));
        }
        match value {
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(|item| self.inbound(item)).collect())
            }
            serde_json::Value::Object(map) => Value::Object(
                map.into_iter()
                    .map(|(key, item)| (key, self.inbound(item)))
                    .collect(),
            ),
            other => Value::from(other),
        }
    }

    /// Unexpose names recorded by [`outbound`](Marshaller::outbound).
    pub(crate) fn release(&self, scoped: &[String]) {
        for name in scoped {
            self.provider.unexpose(name);
        }
    }
}

//! One-shot client used by `ferry-rpc call`.

use anyhow::{bail, Context};
use ferry_core::{Endpoint, TransportRegistry, Value};
use std::sync::Arc;
use tracing::debug;

/// Connect to `address`, invoke `method` once, and return the result as
/// JSON.
pub async fn call(
    registry: &TransportRegistry,
    address: &str,
    method: &str,
    params: Option<&str>,
) -> anyhow::Result<serde_json::Value> {
    let params = parse_params(params)?;

    let endpoint = Endpoint::new();
    let client = registry.create_client(address, Arc::new(endpoint.clone()))?;
    client
        .connect()
        .await
        .with_context(|| format!("failed to connect to {}", address))?;
    debug!("Connected to {}", address);

    let outcome = endpoint.invoke(method, params).await;
    client.close();
    Ok(render(&outcome?))
}

/// Parameters given on the command line: a JSON array, or a single JSON
/// value taken as the only parameter.
pub fn parse_params(raw: Option<&str>) -> anyhow::Result<Vec<Value>> {
    let Some(raw) = raw else {
        return Ok(Vec::new());
    };
    let parsed: serde_json::Value =
        serde_json::from_str(raw).with_context(|| format!("params are not valid JSON: {}", raw))?;
    match parsed {
        serde_json::Value::Array(items) => Ok(items.into_iter().map(Value::from).collect()),
        serde_json::Value::Null => bail!("params must not be null"),
        other => Ok(vec![Value::from(other)]),
    }
}

/// JSON form of a result, with functions shown as a placeholder string.
pub fn render(value: &Value) -> serde_json::Value {
    match value {
        Value::Array(items) => serde_json::Value::Array(items.iter().map(render).collect()),
        Value::Object(map) => serde_json::Value::Object(
            map.iter().map(|(k, v)| (k.clone(), render(v))).collect(),
        ),
        Value::Function(_) => serde_json::Value::String("<function>".to_string()),
        plain => plain.to_json().unwrap_or(serde_json::Value::Null),
    }
}

//! Demo methods served by `ferry-rpc serve`.

use ferry_core::{Method, RpcError, Service, Value};
use tracing::debug;

/// Expose the demo methods on a service template.
pub fn register(service: &Service) -> ferry_core::Result<()> {
    service.expose(Method::sync(echo), Some("echo"))?;
    service.expose(Method::sync(add), Some("add"))?;
    service.expose(Method::sync(|_| Ok(Value::from("foo"))), Some("foo"))?;
    service.expose(Method::sync(bar), Some("bar"))?;
    service.expose(Method::new(baz), Some("baz"))?;
    service.expose(Method::sync(|_| Ok(Value::from("pong"))), Some("ping"))?;
    Ok(())
}

/// Return the first parameter unchanged.
fn echo(params: Vec<Value>) -> ferry_core::Result<Value> {
    Ok(params.into_iter().next().unwrap_or_default())
}

/// Sum of all numeric parameters.
fn add(params: Vec<Value>) -> ferry_core::Result<Value> {
    if params.iter().all(|p| p.as_i64().is_some()) {
        return Ok(Value::from(params.iter().filter_map(Value::as_i64).sum::<i64>()));
    }
    let mut total = 0.0;
    for param in &params {
        total += param.as_f64().ok_or_else(|| RpcError::InvalidParams {
            message: format!("add expects numbers, got {:?}", param),
        })?;
    }
    Ok(Value::from(total))
}

/// Hand the caller a function to call back later.
fn bar(_params: Vec<Value>) -> ferry_core::Result<Value> {
    Ok(Value::from(Method::sync(|_| Ok(Value::from("bar")))))
}

/// Call the function passed as the first parameter and return its result.
async fn baz(params: Vec<Value>) -> ferry_core::Result<Value> {
    let callback = params
        .into_iter()
        .next()
        .filter(|p| p.as_function().is_some())
        .ok_or_else(|| RpcError::InvalidParams {
            message: "baz expects a function".to_string(),
        })?;
    debug!("baz calling back into the caller");
    callback.call(vec![]).await
}

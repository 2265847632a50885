//! Values that cross an endpoint, functions included.
//!
//! [`Value`] mirrors JSON with one extra variant, [`Value::Function`]. Plain
//! data serializes as-is; functions are swapped for method references by the
//! marshalling layer before anything reaches the wire.

use crate::Result;
use async_trait::async_trait;
use serde_json::Number;
use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// Anything that can be invoked with a list of values.
#[async_trait]
pub trait Callable: Send + Sync + 'static {
    async fn call(&self, params: Vec<Value>) -> Result<Value>;
}

struct FnCallable<F>(F);

#[async_trait]
impl<F, Fut> Callable for FnCallable<F>
where
    F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    async fn call(&self, params: Vec<Value>) -> Result<Value> {
        (self.0)(params).await
    }
}

/// A callable value, local or remote.
#[derive(Clone)]
pub struct Method {
    name: Option<String>,
    callable: Arc<dyn Callable>,
    persistent: bool,
}

impl Method {
    /// Wrap an async closure.
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        Self::from_callable(Arc::new(FnCallable(f)))
    }

    /// Wrap an async closure with a declared name, used by `expose` when no
    /// name is given.
    pub fn named<F, Fut>(name: impl Into<String>, f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let mut method = Self::new(f);
        method.name = Some(name.into());
        method
    }

    /// Wrap a synchronous closure.
    pub fn sync<F>(f: F) -> Self
    where
        F: Fn(Vec<Value>) -> Result<Value> + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        Self::new(move |params| {
            let f = f.clone();
            async move { f(params) }
        })
    }

    pub fn from_callable(callable: Arc<dyn Callable>) -> Self {
        Self {
            name: None,
            callable,
            persistent: false,
        }
    }

    /// Keep this function exposed for the endpoint's lifetime when it is
    /// passed as an invocation parameter, instead of only until that
    /// invocation's reply.
    pub fn persistent(mut self) -> Self {
        self.persistent = true;
        self
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref().filter(|name| !name.is_empty())
    }

    pub async fn call(&self, params: Vec<Value>) -> Result<Value> {
        self.callable.call(params).await
    }

    /// Whether both handles share the same underlying callable.
    pub fn same_as(&self, other: &Method) -> bool {
        Arc::ptr_eq(&self.callable, &other.callable)
    }
}

impl fmt::Debug for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Method")
            .field("name", &self.name)
            .field("persistent", &self.persistent)
            .finish_non_exhaustive()
    }
}

/// JSON data plus functions.
#[derive(Debug, Clone, Default)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(Number),
    String(String),
    Array(Vec<Value>),
    Object(BTreeMap<String, Value>),
    Function(Method),
}

impl Value {
    pub fn function(method: Method) -> Self {
        Value::Function(method)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Number(n) => n.as_i64(),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Number(n) => n.as_f64(),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_array(&self) -> Option<&Vec<Value>> {
        match self {
            Value::Array(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_object(&self) -> Option<&BTreeMap<String, Value>> {
        match self {
            Value::Object(map) => Some(map),
            _ => None,
        }
    }

    pub fn as_function(&self) -> Option<&Method> {
        match self {
            Value::Function(method) => Some(method),
            _ => None,
        }
    }

    /// Look up an object property.
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.as_object().and_then(|map| map.get(key))
    }

    /// Plain JSON form, or `None` if a function is nested anywhere inside.
    pub fn to_json(&self) -> Option<serde_json::Value> {
        Some(match self {
            Value::Null => serde_json::Value::Null,
            Value::Bool(b) => serde_json::Value::Bool(*b),
            Value::Number(n) => serde_json::Value::Number(n.clone()),
            Value::String(s) => serde_json::Value::String(s.clone()),
            Value::Array(items) => serde_json::Value::Array(
                items.iter().map(Value::to_json).collect::<Option<_>>()?,
            ),
            Value::Object(map) => serde_json::Value::Object(
                map.iter()
                    .map(|(k, v)| v.to_json().map(|v| (k.clone(), v)))
                    .collect::<Option<_>>()?,
            ),
            Value::Function(_) => return None,
        })
    }

    /// Call a function value.
    pub async fn call(&self, params: Vec<Value>) -> Result<Value> {
        match self {
            Value::Function(method) => method.call(params).await,
            other => Err(crate::RpcError::InvalidParams {
                message: format!("value is not a function: {:?}", other),
            }),
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::Number(a), Value::Number(b)) => a == b,
            (Value::String(a), Value::String(b)) => a == b,
            (Value::Array(a), Value::Array(b)) => a == b,
            (Value::Object(a), Value::Object(b)) => a == b,
            (Value::Function(a), Value::Function(b)) => a.same_as(b),
            _ => false,
        }
    }
}

impl From<serde_json::Value> for Value {
    fn from(value: serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => Value::Number(n),
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::Array(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(map) => {
                Value::Object(map.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

impl From<Method> for Value {
    fn from(method: Method) -> Self {
        Value::Function(method)
    }
}

impl From<bool> for Value {
    fn from(value: bool) -> Self {
        Value::Bool(value)
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Value::Number(value.into())
    }
}

impl From<i32> for Value {
    fn from(value: i32) -> Self {
        Value::Number(value.into())
    }
}

impl From<u64> for Value {
    fn from(value: u64) -> Self {
        Value::Number(value.into())
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Number::from_f64(value).map_or(Value::Null, Value::Number)
    }
}

impl From<&str> for Value {
    fn from(value: &str) -> Self {
        Value::String(value.to_string())
    }
}

impl From<String> for Value {
    fn from(value: String) -> Self {
        Value::String(value)
    }
}

impl<T: Into<Value>> From<Vec<T>> for Value {
    fn from(items: Vec<T>) -> Self {
        Value::Array(items.into_iter().map(Into::into).collect())
    }
}

impl FromIterator<(String, Value)> for Value {
    fn from_iter<I: IntoIterator<Item = (String, Value)>>(iter: I) -> Self {
        Value::Object(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_json_conversion_keeps_structure() {
        let source = json!({"a": [1, "two", null], "b": {"c": true}});
        let value = Value::from(source.clone());
        assert_eq!(value.to_json(), Some(source));
        assert_eq!(value.get("b").and_then(|b| b.get("c")), Some(&Value::Bool(true)));
    }

    #[test]
    fn test_nested_function_has_no_json_form() {
        let f = Method::sync(|_| Ok(Value::Null));
        let value = Value::Array(vec![Value::from(1), Value::Function(f)]);
        assert_eq!(value.to_json(), None);
    }

    #[test]
    fn test_method_name() {
        let anonymous = Method::sync(|_| Ok(Value::Null));
        assert_eq!(anonymous.name(), None);

        let named = Method::named("add", |_| async { Ok(Value::Null) });
        assert_eq!(named.name(), Some("add"));
        assert!(!named.is_persistent());
        assert!(named.persistent().is_persistent());
    }

    #[test]
    fn test_function_equality_is_identity() {
        let f = Method::sync(|_| Ok(Value::Null));
        let g = Method::sync(|_| Ok(Value::Null));
        assert_eq!(Value::Function(f.clone()), Value::Function(f.clone()));
        assert_ne!(Value::Function(f), Value::Function(g));
    }

    #[tokio::test]
    async fn test_call_function_value() {
        let add = Value::Function(Method::sync(|params| {
            let sum: i64 = params.iter().filter_map(Value::as_i64).sum();
            Ok(Value::from(sum))
        }));
        let result = add.call(vec![Value::from(23), Value::from(19)]).await.unwrap();
        assert_eq!(result, Value::from(42));

        let not_callable = Value::from("nope").call(vec![]).await;
        assert!(not_callable.is_err());
    }
}

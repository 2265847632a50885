//! Exposed-method table and dispatch.

use crate::config::EndpointConfig;
use crate::value::{Method, Value};
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::debug;

struct ProviderInner {
    methods: RwLock<HashMap<String, Method>>,
    next_callback: AtomicU64,
}

/// Name -> callable table answering the peer's requests.
///
/// Cloning shares the table; use [`fork`](Provider::fork) for an independent
/// copy.
#[derive(Clone)]
pub struct Provider {
    inner: Arc<ProviderInner>,
}

impl Default for Provider {
    fn default() -> Self {
        Self::new()
    }
}

impl Provider {
    pub fn new() -> Self {
        Self::from_methods(HashMap::new(), 1)
    }

    fn from_methods(methods: HashMap<String, Method>, next_callback: u64) -> Self {
        Self {
            inner: Arc::new(ProviderInner {
                methods: RwLock::new(methods),
                next_callback: AtomicU64::new(next_callback),
            }),
        }
    }

    /// Register a method and return the name it answers to.
    ///
    /// The name is `name` if given, else the method's own name, else a
    /// generated `#N`. An existing entry with the same name is replaced.
    pub fn expose(&self, method: Method, name: Option<&str>) -> Result<String> {
        let name = match name.filter(|n| !n.is_empty()).or(method.name()) {
            Some(name) => name.to_string(),
            None => self.generate_name(),
        };
        self.insert(name.clone(), method)?;
        Ok(name)
    }

    /// Register a function under a fresh generated name.
    pub fn expose_callback(&self, method: Method) -> Result<String> {
        let name = self.generate_name();
        self.insert(name.clone(), method)?;
        Ok(name)
    }

    /// Expose every function found in an object, named by its dotted path
    /// under `prefix` (`prefix.prop`, `prefix.nested.prop`).
    pub fn expose_object(&self, prefix: &str, value: &Value) -> Result<Vec<String>> {
        let Value::Object(map) = value else {
            return Err(RpcError::InvalidParams {
                message: format!("expose_object expects an object for '{}'", prefix),
            });
        };

        let mut exposed = Vec::new();
        for (key, property) in map {
            let path = if prefix.is_empty() {
                key.clone()
            } else {
                format!("{}{}{}", prefix, EndpointConfig::PATH_SEPARATOR, key)
            };
            match property {
                Value::Function(method) => {
                    exposed.push(self.expose(method.clone(), Some(&path))?);
                }
                Value::Object(_) => exposed.extend(self.expose_object(&path, property)?),
                _ => {}
            }
        }
        Ok(exposed)
    }

    /// Remove an entry. Returns false if nothing was registered under `name`.
    pub fn unexpose(&self, name: &str) -> bool {
        match self.write() {
            Ok(mut methods) => methods.remove(name).is_some(),
            Err(_) => false,
        }
    }

    /// Remove all entries with generated names; returns how many went.
    pub fn clear_generated(&self) -> usize {
        let Ok(mut methods) = self.write() else {
            return 0;
        };
        let before = methods.len();
        methods.retain(|name, _| !name.starts_with(EndpointConfig::GENERATED_NAME_PREFIX));
        before - methods.len()
    }

    pub fn get(&self, name: &str) -> Option<Method> {
        self.read().ok()?.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.read().map(|m| m.contains_key(name)).unwrap_or(false)
    }

    /// Exposed names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .read()
            .map(|m| m.keys().cloned().collect())
            .unwrap_or_default();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.read().map(|m| m.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up `method` and call it.
    pub async fn dispatch(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        let target = self.get(method).ok_or_else(|| RpcError::MethodNotFound {
            method: method.to_string(),
        })?;
        target.call(params).await
    }

    /// Independent copy of the current table.
    pub fn fork(&self) -> Provider {
        let methods = self.read().map(|m| m.clone()).unwrap_or_default();
        Self::from_methods(methods, self.inner.next_callback.load(Ordering::Relaxed))
    }

    fn generate_name(&self) -> String {
        let n = self.inner.next_callback.fetch_add(1, Ordering::Relaxed);
        format!("{}{}", EndpointConfig::GENERATED_NAME_PREFIX, n)
    }

    fn insert(&self, name: String, method: Method) -> Result<()> {
        let mut methods = self.write()?;
        if methods.insert(name.clone(), method).is_some() {
            debug!("Replaced exposed method '{}'", name);
        } else {
            debug!("Exposed method '{}'", name);
        }
        Ok(())
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, HashMap<String, Method>>> {
        self.inner
            .methods
            .read()
            .map_err(|_| RpcError::Other("method table lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, HashMap<String, Method>>> {
        self.inner
            .methods
            .write()
            .map_err(|_| RpcError::Other("method table lock poisoned".to_string()))
    }
}

impl std::fmt::Debug for Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Provider")
            .field("methods", &self.names())
            .finish()
    }
}

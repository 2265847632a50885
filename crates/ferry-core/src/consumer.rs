//! Outgoing invocations and their correlation with replies.

use crate::config::EndpointOptions;
use crate::marshal::Marshaller;
use crate::protocol::{Id, Message, NotificationMessage, RequestMessage};
use crate::provider::Provider;
use crate::value::Value;
use crate::{Result, RpcError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

struct Pending {
    reply: oneshot::Sender<Result<Value>>,
    /// Callback names that only live as long as this invocation.
    scoped: Vec<String>,
}

#[derive(Default)]
struct PendingTable {
    entries: HashMap<Id, Pending>,
    closed: bool,
}

pub(crate) struct ConsumerInner {
    next_id: AtomicI64,
    pending: Mutex<PendingTable>,
    outbound: mpsc::UnboundedSender<Message>,
    marshaller: Marshaller,
    options: EndpointOptions,
}

/// Issues invocations to the peer and routes replies back to their callers.
#[derive(Clone)]
pub struct Consumer {
    inner: Arc<ConsumerInner>,
}

impl Consumer {
    pub(crate) fn new(
        provider: Provider,
        outbound: mpsc::UnboundedSender<Message>,
        options: EndpointOptions,
    ) -> Self {
        let inner = Arc::new_cyclic(|weak| ConsumerInner {
            next_id: AtomicI64::new(1),
            pending: Mutex::new(PendingTable::default()),
            outbound,
            marshaller: Marshaller::new(provider, weak.clone()),
            options,
        });
        Self { inner }
    }

    pub(crate) fn from_inner(inner: Arc<ConsumerInner>) -> Self {
        Self { inner }
    }

    pub(crate) fn marshaller(&self) -> &Marshaller {
        &self.inner.marshaller
    }

    /// Invoke a remote method and wait for its result.
    ///
    /// Functions among `params` are exposed for the duration of the call
    /// unless marked persistent. The endpoint's default invoke timeout
    /// applies, if one is configured.
    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.call(method, params, self.inner.options.invoke_timeout)
            .await
    }

    /// Invoke with an explicit deadline.
    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.call(method, params, Some(timeout)).await
    }

    /// Send a notification; no reply is expected.
    ///
    /// Functions among `params` stay exposed for the endpoint's lifetime.
    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        if self.is_closed() {
            return Err(RpcError::ConnectionClosed);
        }
        let params = self.marshal_params(params, &mut Vec::new())?;
        self.inner
            .outbound
            .send(Message::Notification(NotificationMessage::new(method, params)))
            .map_err(|_| RpcError::ConnectionClosed)
    }

    /// Number of invocations awaiting a reply.
    pub fn pending_count(&self) -> usize {
        self.lock().map(|table| table.entries.len()).unwrap_or(0)
    }

    pub fn is_closed(&self) -> bool {
        self.lock().map(|table| table.closed).unwrap_or(true)
    }

    async fn call(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let id = Id::from(self.inner.next_id.fetch_add(1, Ordering::Relaxed));

        let mut scoped = Vec::new();
        let params = match self.marshal_params(params, &mut scoped) {
            Ok(params) => params,
            Err(e) => {
                self.inner.marshaller.release(&scoped);
                return Err(e);
            }
        };

        let (reply, rx) = oneshot::channel();
        {
            let mut table = self.lock()?;
            if table.closed {
                drop(table);
                self.inner.marshaller.release(&scoped);
                return Err(RpcError::ConnectionClosed);
            }
            // Registered before transmitting so a fast reply always finds it.
            table.entries.insert(id.clone(), Pending { reply, scoped });
        }
        let guard = PendingGuard {
            inner: &self.inner,
            id: id.clone(),
        };

        debug!("Invoking '{}' (id {})", method, id);
        let request = Message::Request(RequestMessage::new(id, method, params));
        if self.inner.outbound.send(request).is_err() {
            return Err(RpcError::ConnectionClosed);
        }

        let outcome = match timeout {
            Some(limit) => match tokio::time::timeout(limit, rx).await {
                Ok(outcome) => outcome,
                Err(_) => {
                    debug!("Invocation '{}' timed out after {:?}", method, limit);
                    return Err(RpcError::Timeout(limit));
                }
            },
            None => rx.await,
        };
        drop(guard);

        // A dropped sender means the pending table was torn down.
        outcome.unwrap_or(Err(RpcError::ConnectionClosed))
    }

    fn marshal_params(
        &self,
        params: Vec<Value>,
        scoped: &mut Vec<String>,
    ) -> Result<Vec<serde_json::Value>> {
        params
            .into_iter()
            .map(|param| self.inner.marshaller.outbound(param, scoped))
            .collect()
    }

    /// Route a success or error reply to the invocation waiting for it.
    pub(crate) fn resolve(&self, message: Message) {
        let (id, outcome) = match message {
            Message::Success(reply) => (reply.id, Ok(reply.result)),
            Message::Error(reply) => {
                let Some(id) = reply.id else {
                    warn!(
                        "Peer reported an error without id [{}]: {} {:?}",
                        reply.code, reply.message, reply.data
                    );
                    return;
                };
                let error = RpcError::Remote {
                    code: reply.code,
                    message: reply.message,
                    data: reply.data,
                };
                (id, Err(error))
            }
            other => {
                debug!("Ignoring {} passed to reply routing", other.kind());
                return;
            }
        };

        let pending = match self.lock() {
            Ok(mut table) => table.entries.remove(&id),
            Err(_) => None,
        };
        let Some(pending) = pending else {
            warn!("Dropping reply for unknown invocation id {}", id);
            return;
        };

        self.inner.marshaller.release(&pending.scoped);
        let result = outcome.map(|value| self.inner.marshaller.inbound(value));
        // The caller may have given up already.
        let _ = pending.reply.send(result);
    }

    /// Fail every pending invocation and refuse new ones.
    pub(crate) fn fail_all(&self) -> usize {
        let drained: Vec<Pending> = match self.lock() {
            Ok(mut table) => {
                table.closed = true;
                table.entries.drain().map(|(_, pending)| pending).collect()
            }
            Err(_) => Vec::new(),
        };
        let count = drained.len();
        for pending in drained {
            self.inner.marshaller.release(&pending.scoped);
            let _ = pending.reply.send(Err(RpcError::ConnectionClosed));
        }
        if count > 0 {
            debug!("Failed {} pending invocation(s) on close", count);
        }
        count
    }

    fn lock(&self) -> Result<MutexGuard<'_, PendingTable>> {
        self.inner.lock()
    }
}

impl ConsumerInner {
    fn lock(&self) -> Result<MutexGuard<'_, PendingTable>> {
        self.pending
            .lock()
            .map_err(|_| RpcError::Other("pending invocation table poisoned".to_string()))
    }
}

impl std::fmt::Debug for Consumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Consumer")
            .field("pending", &self.pending_count())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Removes an invocation's pending record when its caller stops waiting,
/// whether it got a reply, timed out or was cancelled.
struct PendingGuard<'a> {
    inner: &'a ConsumerInner,
    id: Id,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let pending = match self.inner.lock() {
            Ok(mut table) => table.entries.remove(&self.id),
            Err(_) => None,
        };
        if let Some(pending) = pending {
            self.inner.marshaller.release(&pending.scoped);
        }
    }
}

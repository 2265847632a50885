//! One consumer and one provider bound to one connection.
//!
//! # Tasks
//!
//! Binding spawns two tasks. The writer drains the outbound queue in order,
//! encoding each message as one line. The reader decodes incoming lines:
//! replies are routed to the consumer inline, while every request and
//! notification is dispatched on a task of its own, so a method that calls
//! back into the peer never blocks the reader.
//!
//! When the peer stops sending (end of input), no reply can arrive any
//! more, so pending invocations fail with [`RpcError::ConnectionClosed`].
//! Requests already read still run to completion and their replies are
//! flushed before the write side closes. [`Endpoint::close`] and I/O
//! failures skip that drain. Either way the endpoint then closes for good:
//! generated callbacks are unexposed and nothing more is dispatched.

use crate::codec::{self, Decoded};
use crate::config::EndpointOptions;
use crate::connection::{ByteSink, ByteStream, Connection, ConnectionHandle};
use crate::consumer::Consumer;
use crate::protocol::{ErrorMessage, Id, Message, NotificationMessage, RequestMessage, SuccessMessage};
use crate::provider::Provider;
use crate::transport::ChannelHandler;
use crate::value::{Method, Value};
use crate::{Result, RpcError};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

struct EndpointInner {
    consumer: Consumer,
    provider: Provider,
    outbound: mpsc::UnboundedSender<Message>,
    queue: Mutex<Option<mpsc::UnboundedReceiver<Message>>>,
    connection: Mutex<Option<ConnectionHandle>>,
    lifecycle: ConnectionHandle,
}

/// Bidirectional JSON-RPC peer.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Default for Endpoint {
    fn default() -> Self {
        Self::new()
    }
}

impl Endpoint {
    pub fn new() -> Self {
        Self::with_provider(Provider::new(), EndpointOptions::default())
    }

    pub fn with_options(options: EndpointOptions) -> Self {
        Self::with_provider(Provider::new(), options)
    }

    /// Build an endpoint around an existing method table.
    pub fn with_provider(provider: Provider, options: EndpointOptions) -> Self {
        let (outbound, queue) = mpsc::unbounded_channel();
        let consumer = Consumer::new(provider.clone(), outbound.clone(), options);
        Self {
            inner: Arc::new(EndpointInner {
                consumer,
                provider,
                outbound,
                queue: Mutex::new(Some(queue)),
                connection: Mutex::new(None),
                lifecycle: ConnectionHandle::new(),
            }),
        }
    }

    pub fn consumer(&self) -> &Consumer {
        &self.inner.consumer
    }

    pub fn provider(&self) -> &Provider {
        &self.inner.provider
    }

    /// Expose a method to the peer; see [`Provider::expose`].
    pub fn expose(&self, method: Method, name: Option<&str>) -> Result<String> {
        self.ensure_open()?;
        self.inner.provider.expose(method, name)
    }

    /// Expose every function in an object; see [`Provider::expose_object`].
    pub fn expose_object(&self, prefix: &str, value: &Value) -> Result<Vec<String>> {
        self.ensure_open()?;
        self.inner.provider.expose_object(prefix, value)
    }

    pub fn unexpose(&self, name: &str) -> bool {
        self.inner.provider.unexpose(name)
    }

    pub async fn invoke(&self, method: &str, params: Vec<Value>) -> Result<Value> {
        self.inner.consumer.invoke(method, params).await
    }

    pub async fn invoke_with_timeout(
        &self,
        method: &str,
        params: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        self.inner
            .consumer
            .invoke_with_timeout(method, params, timeout)
            .await
    }

    pub fn notify(&self, method: &str, params: Vec<Value>) -> Result<()> {
        self.inner.consumer.notify(method, params)
    }

    /// Attach the endpoint to a connection and start exchanging messages.
    ///
    /// An endpoint binds exactly once.
    pub fn bind(&self, connection: Connection) -> Result<()> {
        self.ensure_open()?;
        let queue = self
            .inner
            .queue
            .lock()
            .map_err(|_| RpcError::Other("endpoint state poisoned".to_string()))?
            .take()
            .ok_or(RpcError::AlreadyBound)?;

        let info = connection.info().clone();
        let (readable, writable, handle) = connection.into_parts();
        if let Ok(mut slot) = self.inner.connection.lock() {
            *slot = Some(handle.clone());
        }
        info!("Endpoint bound to {}", info);

        let (finish, finished) = oneshot::channel();
        let writer = tokio::spawn(write_loop(queue, writable, handle.clone(), finished));
        tokio::spawn(read_loop(
            self.inner.clone(),
            readable,
            handle,
            finish,
            writer,
        ));
        Ok(())
    }

    /// Close the endpoint and its connection; idempotent.
    pub fn close(&self) {
        self.inner.shutdown();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lifecycle.is_closed()
    }

    /// Resolve once the endpoint has closed.
    pub async fn closed(&self) {
        self.inner.lifecycle.closed().await
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(RpcError::ConnectionClosed)
        } else {
            Ok(())
        }
    }
}

impl std::fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Endpoint")
            .field("consumer", &self.inner.consumer)
            .field("provider", &self.inner.provider)
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[async_trait]
impl ChannelHandler for Endpoint {
    async fn channel(&self, connection: Connection) -> Result<()> {
        self.bind(connection)
    }
}

impl EndpointInner {
    fn shutdown(&self) {
        if let Some(handle) = self.connection.lock().ok().and_then(|slot| slot.clone()) {
            handle.close();
        }
        if !self.lifecycle.close() {
            return;
        }
        let failed = self.consumer.fail_all();
        let cleared = self.provider.clear_generated();
        debug!(
            "Endpoint closed ({} pending failed, {} callbacks cleared)",
            failed, cleared
        );
    }

    fn send(&self, message: Message) {
        if self.outbound.send(message).is_err() {
            debug!("Outbound queue closed; dropping message");
        }
    }

    fn handle_message(self: &Arc<Self>, message: Message, tasks: &mut JoinSet<()>) {
        match message {
            Message::Request(request) => {
                let inner = self.clone();
                tasks.spawn(async move { inner.answer(request).await });
            }
            Message::Notification(notification) => {
                let inner = self.clone();
                tasks.spawn(async move { inner.observe(notification).await });
            }
            reply @ (Message::Success(_) | Message::Error(_)) => self.consumer.resolve(reply),
        }
    }

    async fn answer(&self, request: RequestMessage) {
        if self.lifecycle.is_closed() {
            return;
        }
        let RequestMessage {
            id, method, params, ..
        } = request;
        let marshaller = self.consumer.marshaller();
        let params = params.into_iter().map(|p| marshaller.inbound(p)).collect();

        let reply = match self.provider.dispatch(&method, params).await {
            Ok(value) => match marshaller.outbound(value, &mut Vec::new()) {
                Ok(result) => Message::Success(SuccessMessage::new(id, result)),
                Err(e) => error_reply(Some(id), &e),
            },
            Err(e) => {
                debug!("Method '{}' failed: {}", method, e);
                error_reply(Some(id), &e)
            }
        };
        self.send(reply);
    }

    async fn observe(&self, notification: NotificationMessage) {
        if self.lifecycle.is_closed() {
            return;
        }
        let marshaller = self.consumer.marshaller();
        let params = notification
            .params
            .into_iter()
            .map(|p| marshaller.inbound(p))
            .collect();
        if let Err(e) = self.provider.dispatch(&notification.method, params).await {
            warn!("Notification '{}' failed: {}", notification.method, e);
        }
    }
}

fn error_reply(id: Option<Id>, error: &RpcError) -> Message {
    let (code, message, data) = error.to_error_parts();
    Message::Error(ErrorMessage::new(id, code, message, data))
}

async fn read_loop(
    inner: Arc<EndpointInner>,
    readable: ByteStream,
    handle: ConnectionHandle,
    finish: oneshot::Sender<()>,
    writer: JoinHandle<()>,
) {
    let mut messages = std::pin::pin!(codec::decode_stream(readable));
    let mut tasks = JoinSet::new();
    let input_ended = loop {
        tokio::select! {
            _ = handle.closed() => break false,
            Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
            item = messages.next() => match item {
                Some(Decoded::Message(message)) => inner.handle_message(message, &mut tasks),
                Some(Decoded::Invalid(err)) => {
                    warn!("Rejecting malformed message: {}", err);
                    inner.send(Message::Error(err.to_error_message()));
                }
                Some(Decoded::Failed(err)) => {
                    warn!("Connection read failed: {}", err);
                    break false;
                }
                None => break true,
            },
        }
    };

    if input_ended {
        debug!(
            "Peer finished sending; draining {} in-flight calls",
            tasks.len()
        );
        inner.consumer.fail_all();
        let drain = async {
            while tasks.join_next().await.is_some() {}
            let _ = finish.send(());
            let _ = writer.await;
        };
        tokio::select! {
            _ = handle.closed() => {}
            _ = drain => {}
        }
    }
    inner.shutdown();
}

async fn write_loop(
    mut queue: mpsc::UnboundedReceiver<Message>,
    mut writable: ByteSink,
    handle: ConnectionHandle,
    mut finish: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            biased;
            _ = handle.closed() => break,
            next = queue.recv() => {
                let Some(message) = next else { break };
                if write_message(&mut writable, &message).await.is_err() {
                    handle.close();
                    break;
                }
            }
            _ = &mut finish => {
                while let Ok(message) = queue.try_recv() {
                    if write_message(&mut writable, &message).await.is_err() {
                        handle.close();
                        break;
                    }
                }
                break;
            }
        }
    }
    let _ = writable.close().await;
}

/// Encode and send one message. Only a failed write is an error; a message
/// that cannot be encoded is logged and skipped.
async fn write_message(writable: &mut ByteSink, message: &Message) -> std::io::Result<()> {
    let bytes = match codec::encode_message(message) {
        Ok(bytes) => bytes,
        Err(e) => {
            warn!("Dropping unencodable {} message: {}", message.kind(), e);
            return Ok(());
        }
    };
    writable.send(bytes).await.map_err(|e| {
        warn!("Connection write failed: {}", e);
        e
    })
}

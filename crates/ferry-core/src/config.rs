//! Centralized configuration for Ferry.
//!
//! Fixed limits live in constant structs; per-endpoint behavior that callers
//! may tune is carried by [`EndpointOptions`].

use std::time::Duration;

/// Wire codec limits.
pub struct CodecConfig;

impl CodecConfig {
    /// Longest line accepted before a newline arrives.
    pub const MAX_LINE_LENGTH: usize = 16 * 1024 * 1024; // 16MB
    pub const INITIAL_BUFFER_CAPACITY: usize = 8192;
}

/// Transport-level configuration.
pub struct TransportConfig;

impl TransportConfig {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
    pub const MAX_CONNECTIONS: usize = 256;
    pub const READ_CHUNK_SIZE: usize = 8192;
    /// Queued response chunks per HTTP exchange before writers wait.
    pub const HTTP_BODY_CHANNEL_CAPACITY: usize = 64;
    pub const HTTP_CONTENT_TYPE: &'static str = "application/x-ndjson";
    pub const HTTP_HEALTH_PATH: &'static str = "/health";
    pub const DEFAULT_TCP_LISTEN_ADDRESS: &'static str = "tcp://[::]:0";
}

/// Endpoint naming conventions.
pub struct EndpointConfig;

impl EndpointConfig {
    /// Prefix of generated method names (`#1`, `#2`, ...).
    pub const GENERATED_NAME_PREFIX: &'static str = "#";
    /// Separator used when exposing a whole object.
    pub const PATH_SEPARATOR: &'static str = ".";
}

/// Runtime options for an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, Default)]
pub struct EndpointOptions {
    /// Deadline applied to every `invoke`; `None` waits until the reply or
    /// the connection closes.
    pub invoke_timeout: Option<Duration>,
}

impl EndpointOptions {
    pub fn with_invoke_timeout(mut self, timeout: Duration) -> Self {
        self.invoke_timeout = Some(timeout);
        self
    }
}

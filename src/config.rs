//! Client configuration.

use crate::{
    auth::{AuthConfig, Credentials},
    extension::Extension,
    handshake::{Headers, UpgradeResponse},
    mask::{MaskingKeyGenerator, RandomMaskingKey},
    reconnect::ReconnectPolicy,
};
use std::{fmt, sync::Arc, time::Duration};

/// 4 MiB of payload plus the largest frame header.
pub const DEFAULT_INCOMING_BUFFER_SIZE: usize = 4_194_315;
pub const DEFAULT_BUFFER_STEP_SIZE: usize = 256;
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_REDIRECT_THRESHOLD: usize = 5;
pub const DEFAULT_MAX_HEADER_LEN: usize = 8192;

/// Runs on every upgrade request before it is sent.
pub type BeforeRequest = Arc<dyn Fn(&mut Headers) + Send + Sync>;
/// Runs on the successful 101 response.
pub type AfterResponse = Arc<dyn Fn(&UpgradeResponse) + Send + Sync>;

/// Configuration shared by every connection attempt of a client.
#[derive(Clone)]
pub struct ClientConfig {
    // Handshake
    /// Time allowed for the whole upgrade, including redirects and auth round trips.
    pub handshake_timeout: Duration,
    /// Follow 3xx answers to the upgrade request.
    pub redirect_enabled: bool,
    /// Redirects followed before giving up.
    pub redirect_threshold: usize,
    /// Retry 503 answers carrying `Retry-After`.
    pub retry_after_enabled: bool,
    pub preferred_subprotocols: Vec<String>,
    /// Offered in this order. Negotiated order is the server's.
    pub extensions: Vec<Arc<dyn Extension>>,
    pub auth_config: AuthConfig,
    pub credentials: Option<Credentials>,
    pub before_request: Option<BeforeRequest>,
    pub after_response: Option<AfterResponse>,
    /// Upper bound on the status line and on the header block, in bytes.
    pub max_header_len: usize,
    /// Log requests and responses at `info` instead of `debug`.
    pub log_upgrade_messages: bool,

    // Session
    /// Largest amount of unprocessed input held at once. Also bounds a reassembled message.
    pub incoming_buffer_size: usize,
    /// Granularity the input buffer grows by.
    pub buffer_step_size: usize,
    pub masking_key_generator: Arc<dyn MaskingKeyGenerator>,
    /// Answer pings automatically.
    pub auto_pong: bool,

    // Reconnect
    pub reconnect_policy: Option<Arc<dyn ReconnectPolicy>>,
    /// Run attempts on the caller's task instead of a spawned one.
    pub synchronous: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            redirect_enabled: false,
            redirect_threshold: DEFAULT_REDIRECT_THRESHOLD,
            retry_after_enabled: false,
            preferred_subprotocols: Vec::new(),
            extensions: Vec::new(),
            auth_config: AuthConfig::default(),
            credentials: None,
            before_request: None,
            after_response: None,
            max_header_len: DEFAULT_MAX_HEADER_LEN,
            log_upgrade_messages: false,
            incoming_buffer_size: DEFAULT_INCOMING_BUFFER_SIZE,
            buffer_step_size: DEFAULT_BUFFER_STEP_SIZE,
            masking_key_generator: Arc::new(RandomMaskingKey),
            auto_pong: true,
            reconnect_policy: None,
            synchronous: false,
        }
    }
}

impl fmt::Debug for ClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientConfig")
            .field("handshake_timeout", &self.handshake_timeout)
            .field("redirect_enabled", &self.redirect_enabled)
            .field("redirect_threshold", &self.redirect_threshold)
            .field("retry_after_enabled", &self.retry_after_enabled)
            .field("preferred_subprotocols", &self.preferred_subprotocols)
            .field("extensions", &self.extensions)
            .field("auth_config", &self.auth_config)
            .field("credentials", &self.credentials)
            .field("before_request", &self.before_request.is_some())
            .field("after_response", &self.after_response.is_some())
            .field("max_header_len", &self.max_header_len)
            .field("log_upgrade_messages", &self.log_upgrade_messages)
            .field("incoming_buffer_size", &self.incoming_buffer_size)
            .field("buffer_step_size", &self.buffer_step_size)
            .field("masking_key_generator", &self.masking_key_generator)
            .field("auto_pong", &self.auto_pong)
            .field("reconnect_policy", &self.reconnect_policy.is_some())
            .field("synchronous", &self.synchronous)
            .finish()
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    #[must_use]
    pub fn redirect_enabled(mut self, enabled: bool) -> Self {
        self.redirect_enabled = enabled;
        self
    }

    #[must_use]
    pub fn redirect_threshold(mut self, threshold: usize) -> Self {
        self.redirect_threshold = threshold;
        self
    }

    #[must_use]
    pub fn retry_after_enabled(mut self, enabled: bool) -> Self {
        self.retry_after_enabled = enabled;
        self
    }

    #[must_use]
    pub fn subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.preferred_subprotocols.push(subprotocol.into());
        self
    }

    #[must_use]
    pub fn extension(mut self, extension: Arc<dyn Extension>) -> Self {
        self.extensions.push(extension);
        self
    }

    #[must_use]
    pub fn auth_config(mut self, auth_config: AuthConfig) -> Self {
        self.auth_config = auth_config;
        self
    }

    #[must_use]
    pub fn credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    #[must_use]
    pub fn before_request(mut self, hook: impl Fn(&mut Headers) + Send + Sync + 'static) -> Self {
        self.before_request = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn after_response(
        mut self,
        hook: impl Fn(&UpgradeResponse) + Send + Sync + 'static,
    ) -> Self {
        self.after_response = Some(Arc::new(hook));
        self
    }

    #[must_use]
    pub fn max_header_len(mut self, len: usize) -> Self {
        self.max_header_len = len;
        self
    }

    #[must_use]
    pub fn log_upgrade_messages(mut self, enabled: bool) -> Self {
        self.log_upgrade_messages = enabled;
        self
    }

    #[must_use]
    pub fn incoming_buffer_size(mut self, size: usize) -> Self {
        self.incoming_buffer_size = size;
        self
    }

    #[must_use]
    pub fn buffer_step_size(mut self, step: usize) -> Self {
        self.buffer_step_size = step;
        self
    }

    #[must_use]
    pub fn masking_key_generator(mut self, generator: Arc<dyn MaskingKeyGenerator>) -> Self {
        self.masking_key_generator = generator;
        self
    }

    #[must_use]
    pub fn auto_pong(mut self, enabled: bool) -> Self {
        self.auto_pong = enabled;
        self
    }

    #[must_use]
    pub fn reconnect_policy(mut self, policy: Arc<dyn ReconnectPolicy>) -> Self {
        self.reconnect_policy = Some(policy);
        self
    }

    #[must_use]
    pub fn synchronous(mut self, synchronous: bool) -> Self {
        self.synchronous = synchronous;
        self
    }
}

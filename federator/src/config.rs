use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("Port cannot be 0")]
    InvalidPort,

    #[error("Splitting factor must be at least 2")]
    InvalidSplittingFactor,

    #[error("Retry-budget threshold must be within 0..=100 percent")]
    InvalidRetryBudgetThreshold,

    #[error("Retry-budget window size cannot be 0")]
    InvalidWindowSize,

    #[error("Client max size cannot be 0")]
    InvalidClientMaxSize,

    #[error("Endpoint connection limits cannot be 0")]
    InvalidConnectionLimit,
}

/// HTTP methods used for endpoint sub-requests
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum RequestMethod {
    #[default]
    Get,
    Post,
}

/// Federator configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Config {
    /// Listener for incoming client requests
    pub listener: Listener,
    /// Routing-discovery service client
    pub routing: RoutingConfig,
    /// Archive endpoint client
    #[serde(default)]
    pub endpoint: EndpointConfig,
    /// Federation engine behaviour
    #[serde(default)]
    pub federation: FederationConfig,
    /// Per-endpoint admission control
    #[serde(default)]
    pub retry_budget: RetryBudgetConfig,
    /// Merged-response cache
    #[serde(default)]
    pub cache: CacheConfig,
}

impl Config {
    /// Validates the federator configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        self.listener.validate()?;

        if self.federation.splitting_factor < 2 {
            return Err(ValidationError::InvalidSplittingFactor);
        }
        if self.federation.client_max_size == 0 {
            return Err(ValidationError::InvalidClientMaxSize);
        }

        if !(0.0..=100.0).contains(&self.retry_budget.threshold_percent) {
            return Err(ValidationError::InvalidRetryBudgetThreshold);
        }
        if self.retry_budget.window_size == 0 {
            return Err(ValidationError::InvalidWindowSize);
        }

        if self.endpoint.connection_limit == 0 || self.endpoint.connection_limit_per_host == 0 {
            return Err(ValidationError::InvalidConnectionLimit);
        }

        Ok(())
    }
}

/// Network listener configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct Listener {
    /// Host address to bind to (e.g., "0.0.0.0" or "127.0.0.1")
    pub host: String,
    /// Port number to listen on
    pub port: u16,
}

impl Listener {
    /// Validates the listener configuration
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.port == 0 {
            return Err(ValidationError::InvalidPort);
        }
        Ok(())
    }
}

/// Routing-discovery client configuration.
///
/// The routing client runs on its own connection pool with its own
/// timeout so that slow archive endpoints never starve route lookups.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct RoutingConfig {
    /// URL of the routing-discovery service query endpoint
    pub url: Url,
    /// Total timeout for a routing lookup, in seconds
    #[serde(default = "default_routing_timeout_secs")]
    pub timeout_secs: u64,
}

/// Archive endpoint client configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct EndpointConfig {
    /// Maximum concurrent endpoint sub-requests across all archives
    pub connection_limit: usize,
    /// Maximum concurrent sub-requests per archive host
    pub connection_limit_per_host: usize,
    /// Timeout for connecting and receiving response headers, in seconds
    pub timeout_connect_secs: u64,
    /// Timeout for each socket read while streaming a body, in seconds
    pub timeout_read_secs: u64,
    /// HTTP method used for endpoint sub-requests
    pub request_method: RequestMethod,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            connection_limit: 120,
            connection_limit_per_host: 10,
            timeout_connect_secs: 2,
            timeout_read_secs: 30,
            request_method: RequestMethod::Get,
        }
    }
}

/// Federation engine configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct FederationConfig {
    /// Ceiling on the whole federation phase, in seconds. Outstanding
    /// workers are aborted when it expires; whatever was merged so far
    /// is returned.
    pub streaming_timeout_secs: u64,
    /// Number of sub-epochs an epoch is divided into on a 413 rejection
    pub splitting_factor: usize,
    /// Epochs shorter than this are never split further; a 413 at this
    /// granularity is a permanent failure.
    pub min_epoch_duration_secs: u64,
    /// Reject queries containing a single epoch longer than this, in days
    pub max_stream_epoch_duration_days: Option<i64>,
    /// Reject queries whose epochs sum to longer than this, in days
    pub max_total_stream_epoch_duration_days: Option<i64>,
    /// Bytes buffered in memory per route before spilling to disk
    pub buffer_rollover_size: usize,
    /// Maximum accepted client POST body size, in bytes
    pub client_max_size: usize,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            streaming_timeout_secs: 600,
            splitting_factor: 2,
            min_epoch_duration_secs: 60,
            max_stream_epoch_duration_days: None,
            max_total_stream_epoch_duration_days: None,
            buffer_rollover_size: 512 * 1024,
            client_max_size: 1024 * 1024,
        }
    }
}

/// Retry-budget configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct RetryBudgetConfig {
    /// Error ratio in percent above which an endpoint is dropped
    pub threshold_percent: f64,
    /// Idle time after which an endpoint's window is discarded, in seconds
    pub ttl_secs: u64,
    /// Number of most recent outcomes kept per endpoint
    pub window_size: usize,
    /// Outcomes required before the threshold is enforced
    pub min_samples: usize,
}

impl Default for RetryBudgetConfig {
    fn default() -> Self {
        Self {
            threshold_percent: 1.0,
            ttl_secs: 3600,
            window_size: 10_000,
            min_samples: 100,
        }
    }
}

/// Cache backend selection
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CacheBackend {
    /// A cache that doesn't cache
    #[default]
    Null,
    InMemory,
}

/// Merged-response cache configuration
#[derive(Clone, Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct CacheConfig {
    pub backend: CacheBackend,
    /// Entry lifetime, in seconds
    pub ttl_secs: u64,
    /// Maximum number of cached responses
    pub max_capacity: u64,
    /// Gzip-compress stored payloads
    pub compress: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Null,
            ttl_secs: 300,
            max_capacity: 1024,
            compress: true,
        }
    }
}

fn default_routing_timeout_secs() -> u64 {
    120
}

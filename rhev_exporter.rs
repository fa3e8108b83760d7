//! # RHEV Exporter - Virtualization Manager to Prometheus Bridge
//!
//! Polls the REST API of a RHEV / oVirt manager on a fixed interval, discovers
//! the per-host statistics the manager exposes and republishes them as labeled
//! Prometheus gauges.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────────────────┐
//! │                              RHEV EXPORTER                                │
//! ├───────────────────────────────────────────────────────────────────────────┤
//! │  POLLER → AGGREGATOR → { REST CLIENT, TOPOLOGY CACHE, METRIC REGISTRY }   │
//! │                                                   ↑                       │
//! │                                  SCRAPE ENDPOINT ─┘ (axum, /metrics)      │
//! └───────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - The **metric registry** is built from live data: one exemplar host is
//!   inspected at startup and every statistic it reports becomes a gauge
//!   family. Names seen later are registered lazily, never dropped.
//! - The **aggregator** folds cluster, host, VM and statistic state into
//!   per-host and per-cluster values once per cycle. Remote failures degrade
//!   a cycle, they never abort it.
//! - The **poller** drives the aggregator on its own task; scrapes are served
//!   concurrently from the same registry.

// ============================================================================
// SECTION 1: IMPORTS & DEPENDENCIES
// ============================================================================

#![allow(dead_code)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]

// ----------------------------------------------------------------------------
// Standard Library Imports
// ----------------------------------------------------------------------------
use std::borrow::Cow;
use std::fmt::{self, Debug, Display, Formatter};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

// ----------------------------------------------------------------------------
// Async Runtime
// ----------------------------------------------------------------------------
use async_trait::async_trait;
use tokio::net::TcpListener as TokioTcpListener;
use tokio::signal;
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

// ----------------------------------------------------------------------------
// Concurrency, Collections & Strings
// ----------------------------------------------------------------------------
use ahash::{AHashMap, AHashSet};
use compact_str::CompactString;
use parking_lot::RwLock;

// ----------------------------------------------------------------------------
// Serialization
// ----------------------------------------------------------------------------
use serde::de::{self as serde_de, DeserializeOwned, Deserializer, Visitor};
use serde::{Deserialize, Serialize};

// ----------------------------------------------------------------------------
// Error Handling
// ----------------------------------------------------------------------------
use anyhow::{Context as AnyhowContext, Result as AnyhowResult};
use thiserror::Error;

// ----------------------------------------------------------------------------
// Logging & Tracing
// ----------------------------------------------------------------------------
use tracing::{debug, error, info, trace, warn};
use tracing_subscriber::{layer::SubscriberExt, EnvFilter};

// ----------------------------------------------------------------------------
// HTTP
// ----------------------------------------------------------------------------
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use reqwest::Client as HttpClient;
use tower_http::trace::TraceLayer;

// ----------------------------------------------------------------------------
// Configuration, CLI & Patterns
// ----------------------------------------------------------------------------
use clap::{Parser, Subcommand};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::{Regex, RegexSet};

// ----------------------------------------------------------------------------
// Prometheus
// ----------------------------------------------------------------------------
use prometheus::{Encoder, GaugeVec, Opts, Registry as PrometheusRegistry, TextEncoder};

// ============================================================================
// SECTION 2: CONSTANTS & VERSION INFORMATION
// ============================================================================

/// Exporter version - follows semantic versioning
pub const EXPORTER_VERSION: &str = env!("CARGO_PKG_VERSION");
pub const EXPORTER_NAME: &str = "rhev-exporter";
pub const EXPORTER_FULL_NAME: &str = "RHEV Prometheus Exporter";

// ----------------------------------------------------------------------------
// Timing & Intervals
// ----------------------------------------------------------------------------

/// Default polling interval (seconds)
pub const DEFAULT_INTERVAL_SECS: u64 = 300;

/// Minimum allowed polling interval (seconds)
pub const MIN_INTERVAL_SECS: u64 = 1;

/// Default timeout for a single API request (seconds)
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

// ----------------------------------------------------------------------------
// Network & Protocol
// ----------------------------------------------------------------------------

/// Default scrape port
pub const DEFAULT_PORT: u16 = 9621;

/// Default scrape bind host (all interfaces)
pub const DEFAULT_HOST: &str = "0.0.0.0";

/// Default scrape path
pub const DEFAULT_METRICS_PATH: &str = "/metrics";

/// Accept header for plain listings
pub const ACCEPT_XML: &str = "application/xml";

/// Accept header asking the manager to inline per-host statistics
pub const ACCEPT_XML_WITH_STATISTICS: &str = "application/xml; detail=statistics";

/// Longest response body excerpt kept in a status error
pub const MAX_ERROR_BODY_LEN: usize = 256;

// ----------------------------------------------------------------------------
// Configuration Sources
// ----------------------------------------------------------------------------

/// Config file looked up when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "rhev_exporter.toml";

/// Prefix for environment overrides (`RHEV_EXPORTER_API__PASSWORD`, ...)
pub const ENV_PREFIX: &str = "RHEV_EXPORTER_";

// ----------------------------------------------------------------------------
// Series Naming
// ----------------------------------------------------------------------------

/// Default prefix of every published series
pub const DEFAULT_NAMESPACE: &str = "rhev";

/// Pseudo-statistic backing `<ns>_host_up`
pub const UP_FAMILY: &str = "up";

/// Pseudo-statistic backing `<ns>_host_activevms`
pub const ACTIVE_VMS_FAMILY: &str = "activevms";

/// Pseudo-statistic backing `<ns>_cluster_activehosts`
pub const ACTIVE_HOSTS_FAMILY: &str = "activehosts";

/// Label carrying the cluster display name
pub const CLUSTER_LABEL: &str = "cluster";

/// Label carrying the host display name
pub const HOST_LABEL: &str = "host";

// ============================================================================
// SECTION 3: ERROR HANDLING FRAMEWORK
// ============================================================================
// One error type per concern:
// - FetchError: anything that went wrong talking to the manager
// - RegistryError: gauge family bookkeeping
// - ConfigError: loading and validating configuration
// ExporterError wraps them all for the startup path.
// ============================================================================

// ----------------------------------------------------------------------------
// 3.1 Top-level Exporter Errors
// ----------------------------------------------------------------------------

/// The main error type for the exporter.
#[derive(Error, Debug)]
pub enum ExporterError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Fetch error: {0}")]
    Fetch(#[from] FetchError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    /// No statistic schema could be discovered at startup.
    #[error("Metric bootstrap failed: {message}")]
    Bootstrap { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Server error: {message}")]
    Server { message: String },

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExporterError {
    /// Check if the next poll cycle can be expected to clear this error
    pub fn is_recoverable(&self) -> bool {
        match self {
            ExporterError::Config(_) => false,
            ExporterError::Fetch(e) => e.is_recoverable(),
            ExporterError::Registry(_) => false,
            ExporterError::Bootstrap { .. } => false,
            ExporterError::Io(_) => true,
            ExporterError::Server { .. } => false,
            ExporterError::Internal(_) => false,
        }
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            ExporterError::Config(_) => "config",
            ExporterError::Fetch(_) => "fetch",
            ExporterError::Registry(_) => "registry",
            ExporterError::Bootstrap { .. } => "bootstrap",
            ExporterError::Io(_) => "io",
            ExporterError::Server { .. } => "server",
            ExporterError::Internal(_) => "internal",
        }
    }

    pub fn bootstrap(message: impl Into<String>) -> Self {
        ExporterError::Bootstrap {
            message: message.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.2 Configuration Errors
// ----------------------------------------------------------------------------

/// Errors related to configuration loading and validation
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to parse configuration: {message}")]
    ParseError { message: String },

    #[error("Invalid configuration value for '{field}': {message}")]
    InvalidValue { field: String, message: String },

    #[error("Missing required configuration field: {field}")]
    MissingField { field: String },
}

impl ConfigError {
    pub fn invalid_value(field: impl Into<String>, message: impl Into<String>) -> Self {
        ConfigError::InvalidValue {
            field: field.into(),
            message: message.into(),
        }
    }

    pub fn missing_field(field: impl Into<String>) -> Self {
        ConfigError::MissingField {
            field: field.into(),
        }
    }
}

// ----------------------------------------------------------------------------
// 3.3 Fetch Errors
// ----------------------------------------------------------------------------

/// A failed read against the management API.
///
/// Callers treat every variant the same way: log it with the resource path
/// and carry on with an empty result for that resource.
#[derive(Error, Debug)]
pub enum FetchError {
    #[error("Failed to build HTTP client: {message}")]
    Client { message: String },

    #[error("Request to '{path}' failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("'{path}' returned HTTP {status}: {body}")]
    Status { path: String, status: u16, body: String },

    #[error("Failed to decode response from '{path}': {message}")]
    Decode { path: String, message: String },
}

impl FetchError {
    /// Resource path the failed request targeted
    pub fn path(&self) -> &str {
        match self {
            FetchError::Client { .. } => "",
            FetchError::Transport { path, .. }
            | FetchError::Status { path, .. }
            | FetchError::Decode { path, .. } => path,
        }
    }

    pub fn is_recoverable(&self) -> bool {
        match self {
            FetchError::Client { .. } => false,
            FetchError::Status { status, .. } => *status != 401 && *status != 403,
            _ => true,
        }
    }

    pub fn status(path: impl Into<String>, status: u16, body: &str) -> Self {
        FetchError::Status {
            path: path.into(),
            status,
            body: excerpt(body),
        }
    }

    pub fn decode(path: impl Into<String>, message: impl Into<String>) -> Self {
        FetchError::Decode {
            path: path.into(),
            message: message.into(),
        }
    }
}

/// Trim a response body down to something that fits in a log line.
fn excerpt(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.chars().count() <= MAX_ERROR_BODY_LEN {
        return trimmed.to_string();
    }
    let mut cut: String = trimmed.chars().take(MAX_ERROR_BODY_LEN).collect();
    cut.push('…');
    cut
}

// ----------------------------------------------------------------------------
// 3.4 Registry Errors
// ----------------------------------------------------------------------------

/// Errors from the dynamic metric registry
#[derive(Error, Debug)]
pub enum RegistryError {
    /// A write targeted a family that was never ensured.
    #[error("Metric family '{name}' was never registered")]
    Unregistered { name: String },

    /// A discovered statistic normalizes to one of the fixed family names.
    #[error("Statistic '{name}' would overwrite fixed family '{series}'")]
    Reserved { name: String, series: String },

    #[error("Prometheus error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("Failed to encode metrics: {message}")]
    Encoding { message: String },
}

// ----------------------------------------------------------------------------
// 3.5 Result Type Aliases
// ----------------------------------------------------------------------------

/// Standard result type for exporter operations
pub type ExporterResult<T> = Result<T, ExporterError>;

/// Result type for remote API reads
pub type FetchResult<T> = Result<T, FetchError>;

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

// ============================================================================
// SECTION 4: CONFIGURATION SYSTEM
// ============================================================================
// TOML file + environment overrides, merged by figment on top of the
// built-in defaults, then validated before anything touches the network.
// ============================================================================

// ----------------------------------------------------------------------------
// 4.1 Main Configuration Structure
// ----------------------------------------------------------------------------

/// Root configuration for the exporter
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ExporterConfig {
    /// Management API connection
    #[serde(default)]
    pub api: ApiConfig,

    /// Polling and series naming
    #[serde(default)]
    pub collection: CollectionConfig,

    /// Scrape endpoint
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl ExporterConfig {
    /// Load configuration: defaults, then the TOML file (if any), then
    /// `RHEV_EXPORTER_*` environment variables.
    ///
    /// An explicitly given path that does not exist is an error.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(ExporterConfig::default()));

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileNotFound {
                    path: path.to_path_buf(),
                });
            }
            figment = figment.merge(Toml::file(path));
        }

        let mut config: Self = figment
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
            .extract()
            .map_err(|e| ConfigError::ParseError {
                message: e.to_string(),
            })?;

        // The env provider parses values; credentials must keep their exact text.
        config.api.apply_raw_env();

        config.validate()?;
        Ok(config)
    }

    /// Load from string (for testing)
    pub fn from_str(toml_str: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(toml_str).map_err(|e| ConfigError::ParseError {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        let endpoint = self.api.endpoint.trim();
        if endpoint.is_empty() {
            return Err(ConfigError::missing_field("api.endpoint"));
        }
        if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
            return Err(ConfigError::invalid_value(
                "api.endpoint",
                format!("'{}' is not an http(s) URL", endpoint),
            ));
        }

        if self.api.timeout_secs == 0 {
            return Err(ConfigError::invalid_value(
                "api.timeout_secs",
                "Request timeout must be at least 1 second",
            ));
        }

        if self.collection.interval_secs < MIN_INTERVAL_SECS {
            return Err(ConfigError::invalid_value(
                "collection.interval_secs",
                format!("Polling interval must be at least {}s", MIN_INTERVAL_SECS),
            ));
        }

        let namespace_pattern = Regex::new(r"^[a-zA-Z_:][a-zA-Z0-9_:]*$")
            .map_err(|e| ConfigError::invalid_value("collection.namespace", e.to_string()))?;
        if !namespace_pattern.is_match(&self.collection.namespace) {
            return Err(ConfigError::invalid_value(
                "collection.namespace",
                format!("'{}' is not a valid metric name prefix", self.collection.namespace),
            ));
        }

        RegexSet::new(&self.collection.exclude_statistics)
            .map_err(|e| ConfigError::invalid_value("collection.exclude_statistics", e.to_string()))?;

        if !self.server.path.starts_with('/') {
            return Err(ConfigError::invalid_value(
                "server.path",
                format!("'{}' must start with '/'", self.server.path),
            ));
        }

        Ok(())
    }

    /// Render the default configuration as TOML
    pub fn generate_default_config() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// 4.2 API Connection Configuration
// ----------------------------------------------------------------------------

/// Management API connection settings
#[derive(Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    /// Base URL of the REST API, e.g. `https://rhevm.example.com/api`
    #[serde(default, deserialize_with = "deserialize_scalar_string")]
    pub endpoint: String,

    /// User for HTTP basic auth (`admin@internal`)
    #[serde(default, deserialize_with = "deserialize_scalar_string")]
    pub user: String,

    /// Password for HTTP basic auth
    #[serde(default, deserialize_with = "deserialize_scalar_string")]
    pub password: String,

    /// Request timeout in seconds
    #[serde(default = "default_http_timeout")]
    pub timeout_secs: u64,

    /// Ask the manager to inline statistics in the host listing instead of
    /// fetching `/hosts/{id}/statistics` per host
    #[serde(default = "default_true")]
    pub inline_statistics: bool,

    /// Skip TLS certificate verification (managers commonly run self-signed)
    #[serde(default = "default_true")]
    pub accept_invalid_certs: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            user: String::new(),
            password: String::new(),
            timeout_secs: default_http_timeout(),
            inline_statistics: true,
            accept_invalid_certs: true,
        }
    }
}

impl Debug for ApiConfig {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiConfig")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("timeout_secs", &self.timeout_secs)
            .field("inline_statistics", &self.inline_statistics)
            .field("accept_invalid_certs", &self.accept_invalid_certs)
            .finish()
    }
}

impl ApiConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Re-read the string settings straight from the environment so that
    /// values such as `0123` are not normalized to numbers.
    fn apply_raw_env(&mut self) {
        let fields: [(&str, &mut String); 3] = [
            ("API__ENDPOINT", &mut self.endpoint),
            ("API__USER", &mut self.user),
            ("API__PASSWORD", &mut self.password),
        ];
        for (key, field) in fields {
            if let Ok(raw) = std::env::var(format!("{}{}", ENV_PREFIX, key)) {
                *field = raw;
            }
        }
    }
}

/// Accept any scalar for a string setting (`password = 123456`).
fn deserialize_scalar_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    struct ScalarString;

    impl<'de> Visitor<'de> for ScalarString {
        type Value = String;

        fn expecting(&self, f: &mut Formatter<'_>) -> fmt::Result {
            f.write_str("a string, number or boolean")
        }

        fn visit_str<E: serde_de::Error>(self, v: &str) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_string<E: serde_de::Error>(self, v: String) -> Result<String, E> {
            Ok(v)
        }

        fn visit_bool<E: serde_de::Error>(self, v: bool) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_i64<E: serde_de::Error>(self, v: i64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_u64<E: serde_de::Error>(self, v: u64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_f64<E: serde_de::Error>(self, v: f64) -> Result<String, E> {
            Ok(v.to_string())
        }

        fn visit_char<E: serde_de::Error>(self, v: char) -> Result<String, E> {
            Ok(v.to_string())
        }
    }

    deserializer.deserialize_any(ScalarString)
}

fn default_http_timeout() -> u64 {
    DEFAULT_HTTP_TIMEOUT_SECS
}

fn default_true() -> bool {
    true
}

// ----------------------------------------------------------------------------
// 4.3 Collection Configuration
// ----------------------------------------------------------------------------

/// Polling cadence and published series shape
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Polling interval in seconds
    #[serde(default = "default_interval")]
    pub interval_secs: u64,

    /// Prefix of every series name
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Publish `<ns>_cluster_*` sums and `<ns>_cluster_activehosts`
    #[serde(default = "default_true")]
    pub cluster_metrics: bool,

    /// Statistic names matching any of these patterns are not exported
    #[serde(default)]
    pub exclude_statistics: Vec<String>,
}

impl Default for CollectionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_interval(),
            namespace: default_namespace(),
            cluster_metrics: true,
            exclude_statistics: Vec::new(),
        }
    }
}

impl CollectionConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }
}

fn default_interval() -> u64 {
    DEFAULT_INTERVAL_SECS
}

fn default_namespace() -> String {
    DEFAULT_NAMESPACE.into()
}

// ----------------------------------------------------------------------------
// 4.4 Scrape Server Configuration
// ----------------------------------------------------------------------------

/// Scrape endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen host
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Metrics path
    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            path: default_metrics_path(),
        }
    }
}

impl ServerConfig {
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

fn default_host() -> String {
    DEFAULT_HOST.into()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_metrics_path() -> String {
    DEFAULT_METRICS_PATH.into()
}

// ----------------------------------------------------------------------------
// 4.5 Logging Configuration
// ----------------------------------------------------------------------------

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format (json, pretty, compact)
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Enable ANSI colors
    #[serde(default = "default_true")]
    pub colors: bool,

    /// Include source location
    #[serde(default)]
    pub source_location: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            colors: true,
            source_location: false,
        }
    }
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "pretty".into()
}

// ----------------------------------------------------------------------------
// 4.6 Runtime Collection Options
// ----------------------------------------------------------------------------

/// The subset of configuration the bootstrap and the aggregator act on,
/// with exclusion patterns compiled once.
#[derive(Debug, Clone)]
pub struct CollectionOptions {
    /// Request inlined statistics with the host listing
    pub inline_statistics: bool,
    /// Publish cluster-scoped families
    pub cluster_metrics: bool,
    exclude: Option<RegexSet>,
}

impl Default for CollectionOptions {
    fn default() -> Self {
        Self {
            inline_statistics: true,
            cluster_metrics: true,
            exclude: None,
        }
    }
}

impl CollectionOptions {
    pub fn from_config(config: &ExporterConfig) -> Result<Self, ConfigError> {
        Self {
            inline_statistics: config.api.inline_statistics,
            cluster_metrics: config.collection.cluster_metrics,
            exclude: None,
        }
        .with_exclusions(&config.collection.exclude_statistics)
    }

    /// Compile statistic exclusion patterns. An empty list excludes nothing.
    pub fn with_exclusions<S: AsRef<str>>(mut self, patterns: &[S]) -> Result<Self, ConfigError> {
        if patterns.is_empty() {
            self.exclude = None;
            return Ok(self);
        }
        let set = RegexSet::new(patterns.iter().map(|p| AsRef::<str>::as_ref(p)))
            .map_err(|e| ConfigError::invalid_value("collection.exclude_statistics", e.to_string()))?;
        self.exclude = Some(set);
        Ok(self)
    }

    pub fn is_excluded(&self, statistic: &str) -> bool {
        self.exclude
            .as_ref()
            .map_or(false, |set| set.is_match(statistic))
    }
}

// ============================================================================
// SECTION 5: LOGGING & TRACING INFRASTRUCTURE
// ============================================================================

/// Initialize the logging system based on configuration.
///
/// `RUST_LOG` directives take precedence over the configured level.
pub fn init_logging(config: &LoggingConfig) -> ExporterResult<()> {
    let level_filter = match config.level.to_lowercase().as_str() {
        "trace" => tracing::level_filters::LevelFilter::TRACE,
        "debug" => tracing::level_filters::LevelFilter::DEBUG,
        "info" => tracing::level_filters::LevelFilter::INFO,
        "warn" | "warning" => tracing::level_filters::LevelFilter::WARN,
        "error" => tracing::level_filters::LevelFilter::ERROR,
        _ => tracing::level_filters::LevelFilter::INFO,
    };

    let env_filter = EnvFilter::builder()
        .with_default_directive(level_filter.into())
        .from_env_lossy();

    match config.format.as_str() {
        "json" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        "compact" => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_ansi(config.colors)
                    .with_target(true),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
        _ => {
            let subscriber = tracing_subscriber::registry().with(env_filter).with(
                tracing_subscriber::fmt::layer()
                    .pretty()
                    .with_ansi(config.colors)
                    .with_target(true)
                    .with_file(config.source_location)
                    .with_line_number(config.source_location),
            );
            tracing::subscriber::set_global_default(subscriber)
                .map_err(|e| ExporterError::Internal(format!("Failed to set logger: {}", e)))?;
        }
    }

    info!(
        target: "rhev::init",
        level = %config.level,
        format = %config.format,
        "Logging initialized"
    );

    Ok(())
}

// ============================================================================
// SECTION 6: API DOCUMENT MODEL
// ============================================================================
// XML shapes returned by the manager, decoded with quick-xml's serde
// support. Attributes are `@name`, elements are plain field names and
// unknown elements are ignored, so richer API versions decode unchanged.
// ============================================================================

// ----------------------------------------------------------------------------
// 6.1 References & Clusters
// ----------------------------------------------------------------------------

/// `<cluster id=".."/>`, `<host id=".."/>`: a link to another resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ResourceRef {
    #[serde(rename = "@id", default)]
    pub id: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ClusterList {
    #[serde(rename = "cluster", default)]
    pub clusters: Vec<Cluster>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct Cluster {
    #[serde(rename = "@id", default)]
    pub id: String,
    #[serde(default)]
    pub name: String,
}

// ----------------------------------------------------------------------------
// 6.2 Hosts
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostList {
    #[serde(rename = "host", default)]
    pub hosts: Vec<Host>,
}

/// A hypervisor host as listed by `/hosts`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Host {
    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub status: Option<HostStatus>,

    #[serde(default)]
    pub cluster: Option<ResourceRef>,

    /// Only present when the listing was requested with `detail=statistics`
    #[serde(default)]
    pub statistics: Option<StatisticList>,
}

impl Host {
    /// Raw state string as reported by the manager, empty if absent
    pub fn raw_state(&self) -> &str {
        self.status.as_ref().map_or("", HostStatus::value)
    }

    pub fn state(&self) -> HostState {
        HostState::from_raw(self.raw_state())
    }

    /// Owning cluster identifier, empty if the host is unassigned
    pub fn cluster_id(&self) -> &str {
        self.cluster.as_ref().map_or("", |c| c.id.as_str())
    }
}

/// `<status><state>up</state></status>` (v3) or `<status>up</status>` (v4)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct HostStatus {
    #[serde(default)]
    pub state: Option<String>,

    #[serde(rename = "$text", default)]
    pub text: Option<String>,
}

impl HostStatus {
    pub fn value(&self) -> &str {
        self.state
            .as_deref()
            .or(self.text.as_deref())
            .map(str::trim)
            .unwrap_or("")
    }
}

/// Operational state collapsed to the two values the `up` gauge can show.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostState {
    Up,
    Down,
}

impl HostState {
    /// Anything other than exactly `up` (maintenance, non_responsive, ...)
    /// is down.
    pub fn from_raw(raw: &str) -> Self {
        if raw == "up" {
            HostState::Up
        } else {
            HostState::Down
        }
    }

    pub fn is_up(self) -> bool {
        self == HostState::Up
    }

    pub fn as_gauge(self) -> f64 {
        match self {
            HostState::Up => 1.0,
            HostState::Down => 0.0,
        }
    }
}

impl Display for HostState {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            HostState::Up => write!(f, "up"),
            HostState::Down => write!(f, "down"),
        }
    }
}

// ----------------------------------------------------------------------------
// 6.3 Statistics
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticList {
    #[serde(rename = "statistic", default)]
    pub statistics: Vec<Statistic>,
}

/// One self-describing reading, e.g. `cpu.load.avg.5m`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Statistic {
    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    #[serde(default)]
    pub description: String,

    #[serde(default)]
    pub unit: String,

    #[serde(rename = "type", default)]
    pub kind: String,

    #[serde(default)]
    pub values: Option<StatisticValues>,
}

impl Statistic {
    /// First datum decoded as a float. `None` when missing or unparseable.
    pub fn value(&self) -> Option<f64> {
        self.values
            .as_ref()?
            .values
            .iter()
            .filter_map(|v| v.datum.as_deref())
            .find_map(|d| d.trim().parse::<f64>().ok())
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticValues {
    #[serde(rename = "@type", default)]
    pub kind: String,

    #[serde(rename = "value", default)]
    pub values: Vec<StatisticValue>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatisticValue {
    #[serde(default)]
    pub datum: Option<String>,
}

// ----------------------------------------------------------------------------
// 6.4 Virtual Machines
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VmList {
    #[serde(rename = "vm", default)]
    pub vms: Vec<Vm>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Vm {
    #[serde(rename = "@id", default)]
    pub id: String,

    #[serde(default)]
    pub name: String,

    /// Absent while the VM is not running anywhere
    #[serde(default)]
    pub host: Option<ResourceRef>,
}

impl Vm {
    pub fn host_id(&self) -> Option<&str> {
        self.host
            .as_ref()
            .map(|h| h.id.as_str())
            .filter(|id| !id.is_empty())
    }
}

/// Number of placed VMs per owning host id. Unplaced VMs are not counted.
pub fn count_vms_by_host(vms: &[Vm]) -> AHashMap<String, usize> {
    let mut counts: AHashMap<String, usize> = AHashMap::new();
    for host_id in vms.iter().filter_map(Vm::host_id) {
        *counts.entry(host_id.to_string()).or_insert(0) += 1;
    }
    counts
}

// ============================================================================
// SECTION 7: REMOTE STATE CLIENT
// ============================================================================
// Read-only access to the four resources the aggregator needs. The trait is
// the seam the engine is tested through; RestClient is the reqwest-backed
// implementation used in production.
// ============================================================================

// ----------------------------------------------------------------------------
// 7.1 Remote API Trait
// ----------------------------------------------------------------------------

/// Read access to the management API.
///
/// Implementations never retry: a failed read is reported once and the next
/// poll cycle is the retry.
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// `GET /clusters`
    async fn clusters(&self) -> FetchResult<Vec<Cluster>>;

    /// `GET /hosts`, optionally with statistics inlined per host
    async fn hosts(&self, inline_statistics: bool) -> FetchResult<Vec<Host>>;

    /// `GET /hosts/{id}/statistics`
    async fn host_statistics(&self, host_id: &str) -> FetchResult<Vec<Statistic>>;

    /// `GET /vms`, optionally restricted to VMs running on `host_name`
    async fn vms(&self, host_name: Option<&str>) -> FetchResult<Vec<Vm>>;
}

// ----------------------------------------------------------------------------
// 7.2 REST Client
// ----------------------------------------------------------------------------

/// reqwest-backed client for the manager's REST API.
pub struct RestClient {
    client: HttpClient,
    endpoint: String,
    user: String,
    password: String,
}

impl Debug for RestClient {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("RestClient")
            .field("endpoint", &self.endpoint)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

impl RestClient {
    pub fn new(config: &ApiConfig) -> FetchResult<Self> {
        let client = HttpClient::builder()
            .timeout(config.timeout())
            .danger_accept_invalid_certs(config.accept_invalid_certs)
            .pool_max_idle_per_host(4)
            .user_agent(format!("{}/{}", EXPORTER_NAME, EXPORTER_VERSION))
            .build()
            .map_err(|e| FetchError::Client {
                message: e.to_string(),
            })?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim().trim_end_matches('/').to_string(),
            user: config.user.clone(),
            password: config.password.clone(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Authenticated GET of `path`, decoded into `T`.
    ///
    /// The body is read to the end before the status is inspected, so the
    /// connection goes back to the pool on every outcome.
    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
        with_statistics: bool,
    ) -> FetchResult<T> {
        let url = format!("{}{}", self.endpoint, path);
        let accept = if with_statistics {
            ACCEPT_XML_WITH_STATISTICS
        } else {
            ACCEPT_XML
        };
        let start = Instant::now();

        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, accept)
            .basic_auth(&self.user, Some(&self.password));
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request.send().await.map_err(|source| FetchError::Transport {
            path: path.to_string(),
            source,
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|source| FetchError::Transport {
            path: path.to_string(),
            source,
        })?;

        trace!(
            target: "rhev::client",
            path = %path,
            status = status.as_u16(),
            bytes = body.len(),
            elapsed_ms = start.elapsed().as_millis() as u64,
            "GET completed"
        );

        if !status.is_success() {
            return Err(FetchError::status(path, status.as_u16(), &body));
        }

        quick_xml::de::from_str(&body).map_err(|e| FetchError::decode(path, e.to_string()))
    }
}

#[async_trait]
impl RemoteApi for RestClient {
    async fn clusters(&self) -> FetchResult<Vec<Cluster>> {
        let list: ClusterList = self.get("/clusters", &[], false).await?;
        Ok(list.clusters)
    }

    async fn hosts(&self, inline_statistics: bool) -> FetchResult<Vec<Host>> {
        let list: HostList = self.get("/hosts", &[], inline_statistics).await?;
        Ok(list.hosts)
    }

    async fn host_statistics(&self, host_id: &str) -> FetchResult<Vec<Statistic>> {
        let path = format!("/hosts/{}/statistics", host_id);
        let list: StatisticList = self.get(&path, &[], false).await?;
        Ok(list.statistics)
    }

    async fn vms(&self, host_name: Option<&str>) -> FetchResult<Vec<Vm>> {
        let query: Vec<(&str, String)> = host_name
            .map(|name| vec![("search", format!("host={}", name))])
            .unwrap_or_default();
        let list: VmList = self.get("/vms", &query, false).await?;
        Ok(list.vms)
    }
}

// ============================================================================
// SECTION 8: TOPOLOGY CACHE
// ============================================================================

/// Cluster and display name of a host, as last seen.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HostInfo {
    pub cluster: String,
    pub name: String,
}

/// Id-to-name maps used to label series.
///
/// Lookups are total: an unknown id resolves to an empty name, never an
/// error. A failed refresh leaves the previous maps in place.
#[derive(Debug, Default)]
pub struct TopologyCache {
    clusters: AHashMap<String, String>,
    hosts: AHashMap<String, HostInfo>,
}

impl TopologyCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cluster map from a fresh listing. Returns the cluster count.
    pub async fn refresh_clusters(&mut self, api: &dyn RemoteApi) -> FetchResult<usize> {
        let clusters = api.clusters().await?;
        self.replace_clusters(&clusters);
        Ok(self.clusters.len())
    }

    /// Replace the host map from a fresh listing and hand the hosts back so
    /// the same response feeds the cycle.
    pub async fn refresh_hosts(
        &mut self,
        api: &dyn RemoteApi,
        inline_statistics: bool,
    ) -> FetchResult<Vec<Host>> {
        let hosts = api.hosts(inline_statistics).await?;
        self.replace_hosts(&hosts);
        Ok(hosts)
    }

    pub fn replace_clusters(&mut self, clusters: &[Cluster]) {
        self.clusters = clusters
            .iter()
            .map(|c| (c.id.clone(), c.name.clone()))
            .collect();
    }

    pub fn replace_hosts(&mut self, hosts: &[Host]) {
        let resolved: AHashMap<String, HostInfo> = hosts
            .iter()
            .map(|h| {
                let info = HostInfo {
                    cluster: self.cluster_name_of(h.cluster_id()).to_string(),
                    name: h.name.clone(),
                };
                (h.id.clone(), info)
            })
            .collect();
        self.hosts = resolved;
    }

    pub fn cluster_name_of(&self, cluster_id: &str) -> &str {
        self.clusters.get(cluster_id).map_or("", String::as_str)
    }

    pub fn host_info_of(&self, host_id: &str) -> HostInfo {
        self.hosts.get(host_id).cloned().unwrap_or_default()
    }

    /// Display names of every known cluster
    pub fn cluster_names(&self) -> impl Iterator<Item = &str> {
        self.clusters.values().map(String::as_str)
    }

    pub fn cluster_count(&self) -> usize {
        self.clusters.len()
    }

    pub fn host_count(&self) -> usize {
        self.hosts.len()
    }
}

// ============================================================================
// SECTION 9: DYNAMIC METRIC REGISTRY
// ============================================================================
// Gauge families are created from the statistics the manager reports rather
// than from a fixed schema. The family index only grows: once a series name
// has been published it stays registered for the life of the process.
//
// One writer (the poller) and any number of scrape readers share the
// registry. Gauge values are atomics inside the prometheus crate; the index
// itself sits behind a parking_lot RwLock that is only write-locked when a
// new family appears.
// ============================================================================

// ----------------------------------------------------------------------------
// 9.1 Scope & Naming
// ----------------------------------------------------------------------------

/// Label shape of a gauge family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MetricScope {
    /// Labeled `{cluster, host}`
    Host,
    /// Labeled `{cluster}`
    Cluster,
}

impl MetricScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricScope::Host => "host",
            MetricScope::Cluster => "cluster",
        }
    }

    pub fn label_names(&self) -> &'static [&'static str] {
        match self {
            MetricScope::Host => &[CLUSTER_LABEL, HOST_LABEL],
            MetricScope::Cluster => &[CLUSTER_LABEL],
        }
    }
}

impl Display for MetricScope {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Replace every character outside `[a-zA-Z0-9_]` with `_`.
///
/// `cpu.load.avg.5m` becomes `cpu_load_avg_5m`.
pub fn normalize_metric_name(name: &str) -> Cow<'_, str> {
    if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Cow::Borrowed(name);
    }
    Cow::Owned(
        name.chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
            .collect(),
    )
}

/// Whether `name` would land on a fixed family (`up`, `activevms`,
/// `activehosts`) in `scope`.
pub fn is_reserved_name(name: &str, scope: MetricScope) -> bool {
    let normalized = normalize_metric_name(name);
    match scope {
        MetricScope::Host => normalized == UP_FAMILY || normalized == ACTIVE_VMS_FAMILY,
        MetricScope::Cluster => normalized == ACTIVE_HOSTS_FAMILY,
    }
}

/// Help text for a family: description plus unit, or the bare name.
pub fn help_text(name: &str, description: &str, unit: &str) -> String {
    let description = description.trim();
    let unit = unit.trim();
    match (description.is_empty(), unit.is_empty()) {
        (true, _) => name.to_string(),
        (false, true) => description.to_string(),
        (false, false) => format!("{} ({})", description, unit),
    }
}

// ----------------------------------------------------------------------------
// 9.2 Gauge Family
// ----------------------------------------------------------------------------

/// One registered gauge family and the statistic it was created for.
pub struct GaugeFamily {
    /// Full series name, e.g. `rhev_host_cpu_load_avg`
    pub series_name: CompactString,
    /// Statistic name the family was first created for
    pub statistic: CompactString,
    pub scope: MetricScope,
    pub help: String,
    gauges: GaugeVec,
}

impl GaugeFamily {
    /// Set the series for `labels`, creating it on first use.
    pub fn set(&self, labels: &[&str], value: f64) -> RegistryResult<()> {
        self.gauges.get_metric_with_label_values(labels)?.set(value);
        Ok(())
    }
}

impl Debug for GaugeFamily {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("GaugeFamily")
            .field("series_name", &self.series_name)
            .field("statistic", &self.statistic)
            .field("scope", &self.scope)
            .field("help", &self.help)
            .finish()
    }
}

// ----------------------------------------------------------------------------
// 9.3 Metric Registry
// ----------------------------------------------------------------------------

#[derive(Default)]
struct FamilyIndex {
    by_series: AHashMap<CompactString, Arc<GaugeFamily>>,
    /// (series name, statistic name) pairs already reported as collisions
    aliases: AHashSet<(CompactString, CompactString)>,
}

/// Process-wide registry of gauge families, shared by the poller and the
/// scrape endpoint.
pub struct MetricRegistry {
    namespace: CompactString,
    registry: PrometheusRegistry,
    families: RwLock<FamilyIndex>,
}

impl Debug for MetricRegistry {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricRegistry")
            .field("namespace", &self.namespace)
            .field("families", &self.family_count())
            .finish()
    }
}

impl MetricRegistry {
    pub fn new(namespace: &str) -> Self {
        Self {
            namespace: CompactString::from(namespace),
            registry: PrometheusRegistry::new(),
            families: RwLock::new(FamilyIndex::default()),
        }
    }

    /// `<namespace>_<scope>_<normalized name>`
    pub fn series_name(&self, scope: MetricScope, name: &str) -> CompactString {
        let mut series = CompactString::with_capacity(self.namespace.len() + name.len() + 9);
        series.push_str(&self.namespace);
        series.push('_');
        series.push_str(scope.as_str());
        series.push('_');
        series.push_str(&normalize_metric_name(name));
        series
    }

    /// Return the family for statistic `name` in `scope`, creating and
    /// registering it if this is the first time the name is seen.
    ///
    /// Statistic names that normalize to an existing series name share that
    /// family; the collision is logged once. Names of the fixed families are
    /// refused with `Reserved`.
    pub fn ensure_family(
        &self,
        name: &str,
        description: &str,
        unit: &str,
        scope: MetricScope,
    ) -> RegistryResult<Arc<GaugeFamily>> {
        if is_reserved_name(name, scope) {
            return Err(RegistryError::Reserved {
                name: name.to_string(),
                series: self.series_name(scope, name).to_string(),
            });
        }
        self.ensure_family_unchecked(name, description, unit, scope)
    }

    fn ensure_family_unchecked(
        &self,
        name: &str,
        description: &str,
        unit: &str,
        scope: MetricScope,
    ) -> RegistryResult<Arc<GaugeFamily>> {
        let series_name = self.series_name(scope, name);

        {
            let index = self.families.read();
            if let Some(family) = index.by_series.get(&series_name) {
                if family.statistic == name
                    || index
                        .aliases
                        .contains(&(series_name.clone(), CompactString::from(name)))
                {
                    return Ok(Arc::clone(family));
                }
            }
        }

        let mut index = self.families.write();

        if let Some(family) = index.by_series.get(&series_name).cloned() {
            if family.statistic != name
                && index
                    .aliases
                    .insert((series_name.clone(), CompactString::from(name)))
            {
                warn!(
                    target: "rhev::registry",
                    series = %series_name,
                    existing = %family.statistic,
                    statistic = %name,
                    "Statistic names collide after normalization, sharing one family"
                );
            }
            return Ok(family);
        }

        let help = help_text(name, description, unit);
        let gauges = GaugeVec::new(Opts::new(series_name.as_str(), help.as_str()), scope.label_names())?;
        self.registry.register(Box::new(gauges.clone()))?;

        let family = Arc::new(GaugeFamily {
            series_name: series_name.clone(),
            statistic: CompactString::from(name),
            scope,
            help,
            gauges,
        });
        index.by_series.insert(series_name.clone(), Arc::clone(&family));

        debug!(
            target: "rhev::registry",
            series = %series_name,
            statistic = %name,
            scope = %scope,
            "Registered gauge family"
        );

        Ok(family)
    }

    /// Look up an already registered family.
    pub fn family(&self, name: &str, scope: MetricScope) -> Option<Arc<GaugeFamily>> {
        let series_name = self.series_name(scope, name);
        self.families.read().by_series.get(&series_name).cloned()
    }

    /// Write one value. Fails with `Unregistered` if `name` was never
    /// ensured in `scope`.
    pub fn set(&self, name: &str, scope: MetricScope, labels: &[&str], value: f64) -> RegistryResult<()> {
        let family = self
            .family(name, scope)
            .ok_or_else(|| RegistryError::Unregistered {
                name: self.series_name(scope, name).to_string(),
            })?;
        family.set(labels, value)
    }

    /// Register the families that exist regardless of discovered statistics.
    pub fn ensure_fixed_families(&self, cluster_metrics: bool) -> RegistryResult<()> {
        self.ensure_family_unchecked(UP_FAMILY, "Host is up (1) or not (0)", "", MetricScope::Host)?;
        self.ensure_family_unchecked(
            ACTIVE_VMS_FAMILY,
            "Number of VMs running on the host",
            "",
            MetricScope::Host,
        )?;
        if cluster_metrics {
            self.ensure_family_unchecked(
                ACTIVE_HOSTS_FAMILY,
                "Number of hosts in the cluster that are up",
                "",
                MetricScope::Cluster,
            )?;
        }
        Ok(())
    }

    pub fn family_count(&self) -> usize {
        self.families.read().by_series.len()
    }

    /// Sorted series names of all registered families
    pub fn series_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .families
            .read()
            .by_series
            .keys()
            .map(|k| k.to_string())
            .collect();
        names.sort();
        names
    }

    /// Current value of one series, looked up through a full gather.
    pub fn sample(&self, series_name: &str, labels: &[(&str, &str)]) -> Option<f64> {
        let gathered = self.registry.gather();
        let family = gathered.iter().find(|mf| mf.get_name() == series_name)?;
        family
            .get_metric()
            .iter()
            .find(|metric| {
                let pairs = metric.get_label();
                pairs.len() == labels.len()
                    && labels.iter().all(|(k, v)| {
                        pairs
                            .iter()
                            .any(|lp| lp.get_name() == *k && lp.get_value() == *v)
                    })
            })
            .map(|metric| metric.get_gauge().get_value())
    }

    /// Render every family in the Prometheus text exposition format.
    pub fn encode_text(&self) -> RegistryResult<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::with_capacity(4096);
        encoder.encode(&families, &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| RegistryError::Encoding {
            message: e.to_string(),
        })
    }
}

// ----------------------------------------------------------------------------
// 9.4 Startup Bootstrap
// ----------------------------------------------------------------------------

/// What the startup discovery found.
#[derive(Debug, Clone, Default)]
pub struct BootstrapReport {
    pub exemplar_host: String,
    pub statistics: usize,
    pub families: usize,
}

impl MetricRegistry {
    /// Discover the statistic schema from the first listed host and register
    /// a family per statistic (host scope, plus cluster scope if enabled).
    ///
    /// Fails if the host listing cannot be read or is empty: there is no
    /// schema to fall back to.
    pub async fn bootstrap(
        &self,
        api: &dyn RemoteApi,
        options: &CollectionOptions,
    ) -> ExporterResult<BootstrapReport> {
        self.ensure_fixed_families(options.cluster_metrics)?;

        let hosts = api
            .hosts(options.inline_statistics)
            .await
            .map_err(|e| ExporterError::bootstrap(format!("host listing failed: {}", e)))?;

        let exemplar = hosts
            .into_iter()
            .next()
            .ok_or_else(|| ExporterError::bootstrap("host listing returned no hosts"))?;

        let statistics = match exemplar.statistics {
            Some(list) if options.inline_statistics => list.statistics,
            _ => api.host_statistics(&exemplar.id).await.map_err(|e| {
                ExporterError::bootstrap(format!(
                    "statistics of exemplar host '{}' unavailable: {}",
                    exemplar.name, e
                ))
            })?,
        };

        let mut discovered = 0usize;
        for stat in &statistics {
            if stat.name.is_empty() || options.is_excluded(&stat.name) {
                continue;
            }
            if is_reserved_name(&stat.name, MetricScope::Host) {
                warn!(
                    target: "rhev::registry",
                    statistic = %stat.name,
                    "Statistic shares a fixed family name, not exported"
                );
                continue;
            }
            self.ensure_family(&stat.name, &stat.description, &stat.unit, MetricScope::Host)?;
            if options.cluster_metrics && !is_reserved_name(&stat.name, MetricScope::Cluster) {
                self.ensure_family(&stat.name, &stat.description, &stat.unit, MetricScope::Cluster)?;
            }
            discovered += 1;
        }

        let report = BootstrapReport {
            exemplar_host: exemplar.name,
            statistics: discovered,
            families: self.family_count(),
        };

        info!(
            target: "rhev::registry",
            exemplar = %report.exemplar_host,
            statistics = report.statistics,
            families = report.families,
            "Metric schema bootstrapped"
        );

        Ok(report)
    }
}

// ============================================================================
// SECTION 10: AGGREGATION ENGINE
// ============================================================================
// One cycle:
//   1. refresh clusters, then hosts (the host listing also feeds step 3)
//   2. count running VMs per host
//   3. per host: up, activevms, every statistic (registering new names),
//      accumulating cluster sums and up-host counts locally
//   4. publish cluster sums and activehosts in one pass
// A failed fetch empties that resource for the cycle. Nothing aborts it.
// ============================================================================

// ----------------------------------------------------------------------------
// 10.1 Cycle Report
// ----------------------------------------------------------------------------

/// Outcome of one aggregation cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CycleReport {
    /// Hosts processed this cycle
    pub hosts: usize,
    /// Host-scoped values written (including `up` and `activevms`)
    pub host_series: usize,
    /// Cluster-scoped values written (including `activehosts`)
    pub cluster_series: usize,
    /// Families registered during this cycle
    pub new_families: usize,
    /// Remote reads that failed
    pub fetch_failures: usize,
    /// Writes the registry rejected
    pub registry_errors: usize,
    pub duration: Duration,
}

impl CycleReport {
    pub fn is_clean(&self) -> bool {
        self.fetch_failures == 0 && self.registry_errors == 0
    }
}

/// Running per-(cluster, series) total for one cycle.
#[derive(Debug, Clone, Default)]
struct ClusterSum {
    /// First statistic name seen for the series
    statistic: String,
    description: String,
    unit: String,
    total: f64,
}

// ----------------------------------------------------------------------------
// 10.2 Aggregator
// ----------------------------------------------------------------------------

/// Folds remote state into the registry, one cycle at a time.
pub struct Aggregator {
    api: Arc<dyn RemoteApi>,
    registry: Arc<MetricRegistry>,
    topology: TopologyCache,
    options: CollectionOptions,
    /// Last observed state per host id, for transition logging
    host_states: AHashMap<String, HostState>,
    /// Statistics already reported as shadowing a fixed family
    reserved_warned: AHashSet<(MetricScope, CompactString)>,
    cycles: u64,
}

impl Debug for Aggregator {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        f.debug_struct("Aggregator")
            .field("topology", &self.topology)
            .field("options", &self.options)
            .field("cycles", &self.cycles)
            .finish()
    }
}

impl Aggregator {
    pub fn new(api: Arc<dyn RemoteApi>, registry: Arc<MetricRegistry>, options: CollectionOptions) -> Self {
        Self {
            api,
            registry,
            topology: TopologyCache::new(),
            options,
            host_states: AHashMap::new(),
            reserved_warned: AHashSet::new(),
            cycles: 0,
        }
    }

    pub fn topology(&self) -> &TopologyCache {
        &self.topology
    }

    pub fn cycles(&self) -> u64 {
        self.cycles
    }

    /// Run one full cycle and report what it did.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let start = Instant::now();
        self.cycles += 1;
        let families_before = self.registry.family_count();
        let mut report = CycleReport::default();

        debug!(target: "rhev::engine", cycle = self.cycles, "Starting poll cycle");

        // 1. Topology
        if let Err(e) = self.topology.refresh_clusters(self.api.as_ref()).await {
            report.fetch_failures += 1;
            error!(target: "rhev::engine", path = %e.path(), error = %e, "Failed to fetch clusters");
        }

        let (hosts, hosts_listed) = match self
            .topology
            .refresh_hosts(self.api.as_ref(), self.options.inline_statistics)
            .await
        {
            Ok(hosts) => (hosts, true),
            Err(e) => {
                report.fetch_failures += 1;
                error!(target: "rhev::engine", path = %e.path(), error = %e, "Failed to fetch hosts");
                (Vec::new(), false)
            }
        };

        // 2. VM placement
        let vm_counts = match self.api.vms(None).await {
            Ok(vms) => count_vms_by_host(&vms),
            Err(e) => {
                report.fetch_failures += 1;
                error!(target: "rhev::engine", path = %e.path(), error = %e, "Failed to fetch VMs");
                AHashMap::new()
            }
        };

        // 3. Hosts
        // Keyed by cluster series name so aliased statistics fold together
        let mut cluster_sums: AHashMap<(String, CompactString), ClusterSum> = AHashMap::new();
        let mut active_hosts: AHashMap<String, usize> = self
            .topology
            .cluster_names()
            .map(|name| (name.to_string(), 0))
            .collect();

        for mut host in hosts {
            report.hosts += 1;
            let info = self.topology.host_info_of(&host.id);
            let labels = [info.cluster.as_str(), info.name.as_str()];
            let state = host.state();
            self.observe_state(&host, &info, state);

            self.publish(&mut report, UP_FAMILY, MetricScope::Host, &labels, state.as_gauge());
            let vms = vm_counts.get(&host.id).copied().unwrap_or(0);
            self.publish(&mut report, ACTIVE_VMS_FAMILY, MetricScope::Host, &labels, vms as f64);

            let statistics = self.statistics_for(&mut host, &mut report).await;
            // One contribution per cluster series and host; the last
            // statistic wins, as it does for the host series.
            let mut contributions: AHashMap<CompactString, (f64, &Statistic)> = AHashMap::new();
            for stat in &statistics {
                if stat.name.is_empty() || self.options.is_excluded(&stat.name) {
                    continue;
                }
                if is_reserved_name(&stat.name, MetricScope::Host) {
                    self.warn_reserved(&stat.name, MetricScope::Host);
                    continue;
                }

                let family = match self.registry.ensure_family(
                    &stat.name,
                    &stat.description,
                    &stat.unit,
                    MetricScope::Host,
                ) {
                    Ok(family) => family,
                    Err(e) => {
                        report.registry_errors += 1;
                        warn!(target: "rhev::engine", statistic = %stat.name, error = %e, "Cannot register statistic");
                        continue;
                    }
                };

                let Some(value) = stat.value() else {
                    debug!(
                        target: "rhev::engine",
                        host = %info.name,
                        statistic = %stat.name,
                        "Statistic has no numeric datum, skipped"
                    );
                    continue;
                };

                match family.set(&labels, value) {
                    Ok(()) => report.host_series += 1,
                    Err(e) => {
                        report.registry_errors += 1;
                        warn!(target: "rhev::engine", series = %family.series_name, error = %e, "Failed to set gauge");
                    }
                }

                if self.options.cluster_metrics {
                    if is_reserved_name(&stat.name, MetricScope::Cluster) {
                        self.warn_reserved(&stat.name, MetricScope::Cluster);
                    } else {
                        let series = self.registry.series_name(MetricScope::Cluster, &stat.name);
                        contributions.insert(series, (value, stat));
                    }
                }
            }

            for (series, (value, stat)) in contributions {
                let sum = cluster_sums
                    .entry((info.cluster.clone(), series))
                    .or_insert_with(|| ClusterSum {
                        statistic: stat.name.clone(),
                        description: stat.description.clone(),
                        unit: stat.unit.clone(),
                        total: 0.0,
                    });
                sum.total += value;
            }

            if self.options.cluster_metrics && state.is_up() {
                *active_hosts.entry(info.cluster.clone()).or_insert(0) += 1;
            }
        }

        // 4. Cluster aggregates
        if self.options.cluster_metrics {
            for ((cluster, _series), sum) in &cluster_sums {
                match self.registry.ensure_family(
                    &sum.statistic,
                    &sum.description,
                    &sum.unit,
                    MetricScope::Cluster,
                ) {
                    Ok(family) => match family.set(&[cluster.as_str()], sum.total) {
                        Ok(()) => report.cluster_series += 1,
                        Err(e) => {
                            report.registry_errors += 1;
                            warn!(target: "rhev::engine", series = %family.series_name, error = %e, "Failed to set gauge");
                        }
                    },
                    Err(e) => {
                        report.registry_errors += 1;
                        warn!(target: "rhev::engine", statistic = %sum.statistic, error = %e, "Cannot register statistic");
                    }
                }
            }

            // Without a host listing every count would read 0; the last
            // published ones stay instead.
            if hosts_listed {
                for (cluster, count) in &active_hosts {
                    self.publish(
                        &mut report,
                        ACTIVE_HOSTS_FAMILY,
                        MetricScope::Cluster,
                        &[cluster.as_str()],
                        *count as f64,
                    );
                }
            }
        }

        report.new_families = self.registry.family_count().saturating_sub(families_before);
        report.duration = start.elapsed();
        report
    }

    /// Statistics for one host: inlined ones when available, otherwise a
    /// per-host fetch. A failed fetch yields no statistics.
    async fn statistics_for(&self, host: &mut Host, report: &mut CycleReport) -> Vec<Statistic> {
        if self.options.inline_statistics {
            if let Some(list) = host.statistics.take() {
                return list.statistics;
            }
        }

        match self.api.host_statistics(&host.id).await {
            Ok(statistics) => statistics,
            Err(e) => {
                report.fetch_failures += 1;
                error!(
                    target: "rhev::engine",
                    path = %e.path(),
                    host = %host.name,
                    error = %e,
                    "Failed to fetch host statistics"
                );
                Vec::new()
            }
        }
    }

    /// Write one fixed-family value, counting it in the report.
    fn publish(
        &self,
        report: &mut CycleReport,
        name: &str,
        scope: MetricScope,
        labels: &[&str],
        value: f64,
    ) {
        match self.registry.set(name, scope, labels, value) {
            Ok(()) => match scope {
                MetricScope::Host => report.host_series += 1,
                MetricScope::Cluster => report.cluster_series += 1,
            },
            Err(e) => {
                report.registry_errors += 1;
                warn!(target: "rhev::engine", name = %name, scope = %scope, error = %e, "Failed to publish value");
            }
        }
    }

    fn warn_reserved(&mut self, statistic: &str, scope: MetricScope) {
        if self
            .reserved_warned
            .insert((scope, CompactString::from(statistic)))
        {
            warn!(
                target: "rhev::engine",
                statistic = %statistic,
                scope = %scope,
                "Statistic shares a fixed family name, not exported"
            );
        }
    }

    fn observe_state(&mut self, host: &Host, info: &HostInfo, state: HostState) {
        match self.host_states.insert(host.id.clone(), state) {
            None => debug!(
                target: "rhev::engine",
                host = %info.name,
                cluster = %info.cluster,
                state = %state,
                raw_state = %host.raw_state(),
                "Host first seen"
            ),
            Some(previous) if previous != state => info!(
                target: "rhev::engine",
                host = %info.name,
                cluster = %info.cluster,
                from = %previous,
                to = %state,
                raw_state = %host.raw_state(),
                "Host state changed"
            ),
            Some(_) => {}
        }
    }
}

// ============================================================================
// SECTION 11: POLL SCHEDULER
// ============================================================================

/// Drives the aggregator on a fixed interval until cancelled.
#[derive(Debug)]
pub struct Poller {
    aggregator: Aggregator,
    interval: Duration,
}

impl Poller {
    pub fn new(aggregator: Aggregator, interval: Duration) -> Self {
        Self { aggregator, interval }
    }

    /// Run cycles back to back with `interval` of sleep in between, until
    /// `shutdown` fires. Returns the number of completed cycles.
    ///
    /// Cancellation is checked between cycles and during the sleep; a cycle
    /// in flight always runs to completion.
    pub async fn run(mut self, shutdown: CancellationToken) -> u64 {
        info!(
            target: "rhev::poller",
            interval_secs = self.interval.as_secs_f64(),
            "Poller started"
        );

        let mut completed = 0u64;
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let report = self.aggregator.run_cycle().await;
            completed += 1;

            if report.is_clean() {
                debug!(
                    target: "rhev::poller",
                    cycle = completed,
                    hosts = report.hosts,
                    host_series = report.host_series,
                    cluster_series = report.cluster_series,
                    new_families = report.new_families,
                    duration_ms = report.duration.as_millis() as u64,
                    "Poll cycle complete"
                );
            } else {
                warn!(
                    target: "rhev::poller",
                    cycle = completed,
                    hosts = report.hosts,
                    fetch_failures = report.fetch_failures,
                    registry_errors = report.registry_errors,
                    duration_ms = report.duration.as_millis() as u64,
                    "Poll cycle completed with errors"
                );
            }

            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = sleep(self.interval) => {}
            }
        }

        info!(target: "rhev::poller", cycles = completed, "Poller stopped");
        completed
    }
}

// ============================================================================
// SECTION 12: SCRAPE ENDPOINT
// ============================================================================
// Thin axum layer over the registry. Every request re-encodes the current
// values; there is no caching between scrapes.
// ============================================================================

/// Router serving the registry at `path`.
pub fn router(registry: Arc<MetricRegistry>, path: &str) -> Router {
    Router::new()
        .route(path, get(metrics_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(registry)
}

async fn metrics_handler(State(registry): State<Arc<MetricRegistry>>) -> Response {
    match registry.encode_text() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            error!(target: "rhev::server", error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// Bind the scrape endpoint and serve until `shutdown` fires.
pub async fn serve(
    config: &ServerConfig,
    registry: Arc<MetricRegistry>,
    shutdown: CancellationToken,
) -> ExporterResult<()> {
    let address = config.bind_address();
    let listener = TokioTcpListener::bind(&address)
        .await
        .map_err(|e| ExporterError::Server {
            message: format!("Failed to bind {}: {}", address, e),
        })?;

    let local_address = listener.local_addr()?;
    info!(
        target: "rhev::server",
        address = %local_address,
        path = %config.path,
        "Serving metrics"
    );

    axum::serve(listener, router(registry, &config.path))
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .map_err(|e| ExporterError::Server {
            message: e.to_string(),
        })?;

    info!(target: "rhev::server", "Scrape endpoint stopped");
    Ok(())
}

// ============================================================================
// SECTION 13: CLI, STARTUP & MAIN ENTRY POINT
// ============================================================================

// ----------------------------------------------------------------------------
// 13.1 CLI Argument Parser
// ----------------------------------------------------------------------------

/// RHEV Exporter CLI
#[derive(Parser, Debug)]
#[command(
    name = "rhev-exporter",
    author = "AIOps Team",
    version,
    about = "Prometheus exporter for RHEV / oVirt host and cluster statistics",
    long_about = "Polls the REST API of a RHEV or oVirt manager, discovers the \
                  statistics each host reports and serves them as labeled \
                  Prometheus gauges, per host and summed per cluster."
)]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = DEFAULT_CONFIG_PATH, env = "RHEV_EXPORTER_CONFIG")]
    pub config: PathBuf,

    /// Log level override
    #[arg(short, long, env = "RHEV_EXPORTER_LOG_LEVEL")]
    pub log_level: Option<String>,

    /// Enable debug logging
    #[arg(short, long)]
    pub debug: bool,

    /// Subcommand to run (defaults to `run`)
    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Available subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start polling and serving metrics
    Run,

    /// Validate configuration file
    Validate {
        /// Show full parsed configuration
        #[arg(short, long)]
        verbose: bool,
    },

    /// Generate default configuration file
    GenerateConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show version and build info
    Version,
}

// ----------------------------------------------------------------------------
// 13.2 CLI Handler Functions
// ----------------------------------------------------------------------------

/// Load the config at `path`. A missing file at the default location is not
/// an error: defaults and environment overrides are used instead.
pub fn resolve_config(path: &Path) -> Result<ExporterConfig, ConfigError> {
    if path == Path::new(DEFAULT_CONFIG_PATH) && !path.exists() {
        ExporterConfig::load(None)
    } else {
        ExporterConfig::load(Some(path))
    }
}

/// Handle the validate subcommand
fn handle_validate(config_path: &Path, verbose: bool) -> ExporterResult<()> {
    println!("Validating configuration file: {}", config_path.display());

    match resolve_config(config_path) {
        Ok(config) => {
            println!("✅ Configuration is valid!");

            if verbose {
                println!("\n📋 Parsed configuration:");
                println!("{}", "=".repeat(60));
                match toml::to_string_pretty(&config) {
                    Ok(s) => println!("{}", s),
                    Err(e) => println!("Failed to serialize: {}", e),
                }
            }

            println!("\n📊 Configuration Summary:");
            println!("  • Endpoint: {}", config.api.endpoint);
            println!("  • User: {}", config.api.user);
            println!("  • Poll interval: {}s", config.collection.interval_secs);
            println!(
                "  • Statistics: {}",
                if config.api.inline_statistics { "inlined" } else { "per-host requests" }
            );
            println!("  • Cluster metrics: {}", config.collection.cluster_metrics);
            println!(
                "  • Listening on: http://{}{}",
                config.server.bind_address(),
                config.server.path
            );

            Ok(())
        }
        Err(e) => {
            println!("❌ Configuration validation failed!");
            println!("Error: {}", e);
            Err(ExporterError::Config(e))
        }
    }
}

/// Handle the generate-config subcommand
fn handle_generate_config(output: Option<&Path>) -> ExporterResult<()> {
    let config_str = ExporterConfig::generate_default_config();

    match output {
        Some(path) => {
            fs::write(path, &config_str)?;
            println!("✅ Default configuration written to: {}", path.display());
        }
        None => {
            println!("{}", config_str);
        }
    }

    Ok(())
}

/// Handle the version subcommand
fn handle_version() {
    println!("{} v{}", EXPORTER_FULL_NAME, EXPORTER_VERSION);
    println!();
    println!("Build Information:");
    println!("  • Target: {}", std::env::consts::ARCH);
    println!("  • OS: {}", std::env::consts::OS);
    println!();
    println!("Defaults:");
    println!("  • Port: {}", DEFAULT_PORT);
    println!("  • Path: {}", DEFAULT_METRICS_PATH);
    println!("  • Poll interval: {}s", DEFAULT_INTERVAL_SECS);
}

// ----------------------------------------------------------------------------
// 13.3 Startup
// ----------------------------------------------------------------------------

/// Resolve on SIGINT or SIGTERM.
pub async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(target: "rhev::init", error = %e, "Failed to listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(target: "rhev::init", error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!(target: "rhev::init", "Received SIGINT"),
        _ = terminate => info!(target: "rhev::init", "Received SIGTERM"),
    }
}

/// Bootstrap the registry, then run the poller and the scrape endpoint until
/// a shutdown signal arrives.
pub async fn run_exporter(config: ExporterConfig) -> ExporterResult<()> {
    info!(
        target: "rhev::init",
        version = EXPORTER_VERSION,
        endpoint = %config.api.endpoint,
        interval_secs = config.collection.interval_secs,
        "Starting {}",
        EXPORTER_FULL_NAME
    );

    let options = CollectionOptions::from_config(&config)?;
    let api: Arc<dyn RemoteApi> = Arc::new(RestClient::new(&config.api)?);
    let registry = Arc::new(MetricRegistry::new(&config.collection.namespace));

    registry.bootstrap(api.as_ref(), &options).await?;

    let shutdown = CancellationToken::new();
    let signal_token = shutdown.clone();
    tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        signal_token.cancel();
    });

    let aggregator = Aggregator::new(Arc::clone(&api), Arc::clone(&registry), options);
    let poller = Poller::new(aggregator, config.collection.interval());
    let poller_handle = tokio::spawn(poller.run(shutdown.clone()));

    let served = serve(&config.server, Arc::clone(&registry), shutdown.clone()).await;

    shutdown.cancel();
    match poller_handle.await {
        Ok(cycles) => info!(target: "rhev::init", cycles, "Exporter stopped"),
        Err(e) => warn!(target: "rhev::init", error = %e, "Poller task did not finish cleanly"),
    }

    served
}

// ----------------------------------------------------------------------------
// 13.4 Main
// ----------------------------------------------------------------------------

/// Main entry point for the exporter
#[tokio::main]
async fn main() -> AnyhowResult<()> {
    let cli = Cli::parse();

    // Subcommands that don't need logging or the network
    match &cli.command {
        Some(Commands::Version) => {
            handle_version();
            return Ok(());
        }
        Some(Commands::GenerateConfig { output }) => {
            handle_generate_config(output.as_deref())?;
            return Ok(());
        }
        Some(Commands::Validate { verbose }) => {
            handle_validate(&cli.config, *verbose)?;
            return Ok(());
        }
        Some(Commands::Run) | None => {}
    }

    let config_file_found = cli.config.exists();
    let config = resolve_config(&cli.config)
        .with_context(|| format!("Failed to load config from {}", cli.config.display()))?;

    let mut logging_config = config.logging.clone();
    if let Some(level) = &cli.log_level {
        logging_config.level = level.clone();
    }
    if cli.debug {
        logging_config.level = "debug".into();
    }

    init_logging(&logging_config).context("Failed to initialize logging")?;

    if !config_file_found {
        warn!(
            target: "rhev::init",
            path = %cli.config.display(),
            "Config file not found, using defaults and environment"
        );
    }

    if let Err(e) = run_exporter(config).await {
        error!(
            target: "rhev::init",
            category = e.category(),
            error = %e,
            "Exporter failed"
        );
        return Err(e.into());
    }

    Ok(())
}

// ============================================================================
// SECTION 14: TESTS
// ============================================================================


#[cfg(test)]
mod engine_tests {
    use super::*;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;

    // ------------------------------------------------------------------------
    // In-memory management API
    // ------------------------------------------------------------------------

    /// `None` in a slot makes that listing fail with HTTP 500. Host ids
    /// missing from `statistics` fail their per-host request.
    #[derive(Default)]
    struct FakeApi {
        clusters: Mutex<Option<Vec<Cluster>>>,
        hosts: Mutex<Option<Vec<Host>>>,
        statistics: Mutex<AHashMap<String, Vec<Statistic>>>,
        vms: Mutex<Option<Vec<Vm>>>,
        calls: Mutex<Vec<String>>,
        cancel_after_vm_calls: Mutex<Option<(usize, CancellationToken)>>,
    }

    impl FakeApi {
        /// One cluster, one up host with one statistic, one VM on it.
        fn scenario() -> Self {
            let api = FakeApi::default();
            *api.clusters.lock() = Some(vec![cluster("c1", "Prod")]);
            *api.hosts.lock() = Some(vec![host("h1", "hostA", "c1", "up", vec![stat("cpu.load.avg", 0.42)])]);
            *api.vms.lock() = Some(vec![vm("v1", Some("h1"))]);
            api
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().clone()
        }

        fn fail<T>(path: &str) -> FetchResult<T> {
            Err(FetchError::status(path, 500, "internal error"))
        }
    }

    #[async_trait]
    impl RemoteApi for FakeApi {
        async fn clusters(&self) -> FetchResult<Vec<Cluster>> {
            self.calls.lock().push("/clusters".into());
            self.clusters.lock().clone().map_or_else(|| Self::fail("/clusters"), Ok)
        }

        async fn hosts(&self, inline_statistics: bool) -> FetchResult<Vec<Host>> {
            self.calls.lock().push("/hosts".into());
            let mut hosts = match self.hosts.lock().clone() {
                Some(hosts) => hosts,
                None => return Self::fail("/hosts"),
            };
            if !inline_statistics {
                for host in &mut hosts {
                    host.statistics = None;
                }
            }
            Ok(hosts)
        }

        async fn host_statistics(&self, host_id: &str) -> FetchResult<Vec<Statistic>> {
            let path = format!("/hosts/{}/statistics", host_id);
            self.calls.lock().push(path.clone());
            self.statistics
                .lock()
                .get(host_id)
                .cloned()
                .map_or_else(|| Self::fail(&path), Ok)
        }

        async fn vms(&self, _host_name: Option<&str>) -> FetchResult<Vec<Vm>> {
            let vm_calls = {
                let mut calls = self.calls.lock();
                calls.push("/vms".into());
                calls.iter().filter(|c| c.as_str() == "/vms").count()
            };
            if let Some((limit, token)) = self.cancel_after_vm_calls.lock().as_ref() {
                if vm_calls >= *limit {
                    token.cancel();
                }
            }
            self.vms.lock().clone().map_or_else(|| Self::fail("/vms"), Ok)
        }
    }

    fn cluster(id: &str, name: &str) -> Cluster {
        Cluster { id: id.into(), name: name.into() }
    }

    fn host(id: &str, name: &str, cluster_id: &str, state: &str, stats: Vec<Statistic>) -> Host {
        Host {
            id: id.into(),
            name: name.into(),
            status: Some(HostStatus { state: Some(state.into()), text: None }),
            cluster: Some(ResourceRef { id: cluster_id.into() }),
            statistics: Some(StatisticList { statistics: stats }),
        }
    }

    fn stat(name: &str, value: f64) -> Statistic {
        Statistic {
            id: format!("s-{}", name),
            name: name.into(),
            description: format!("{} reading", name),
            unit: "NONE".into(),
            kind: "GAUGE".into(),
            values: Some(StatisticValues {
                kind: "DECIMAL".into(),
                values: vec![StatisticValue { datum: Some(value.to_string()) }],
            }),
        }
    }

    fn vm(id: &str, host_id: Option<&str>) -> Vm {
        Vm {
            id: id.into(),
            name: format!("vm-{}", id),
            host: host_id.map(|h| ResourceRef { id: h.into() }),
        }
    }

    async fn bootstrapped(api: &Arc<FakeApi>, options: CollectionOptions) -> (Arc<MetricRegistry>, Aggregator) {
        let registry = Arc::new(MetricRegistry::new("rhev"));
        registry.bootstrap(api.as_ref(), &options).await.unwrap();
        let aggregator = Aggregator::new(api.clone(), Arc::clone(&registry), options);
        (registry, aggregator)
    }

    fn host_value(registry: &MetricRegistry, series: &str, cluster: &str, host: &str) -> Option<f64> {
        registry.sample(series, &[("cluster", cluster), ("host", host)])
    }

    fn cluster_value(registry: &MetricRegistry, series: &str, cluster: &str) -> Option<f64> {
        registry.sample(series, &[("cluster", cluster)])
    }

    // ------------------------------------------------------------------------
    // Bootstrap
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_bootstrap_registers_exemplar_statistics() {
        let api = FakeApi::scenario();
        let registry = MetricRegistry::new("rhev");
        let report = registry.bootstrap(&api, &CollectionOptions::default()).await.unwrap();

        assert_eq!(report.exemplar_host, "hostA");
        assert_eq!(report.statistics, 1);
        assert_eq!(
            registry.series_names(),
            vec![
                "rhev_cluster_activehosts",
                "rhev_cluster_cpu_load_avg",
                "rhev_host_activevms",
                "rhev_host_cpu_load_avg",
                "rhev_host_up",
            ]
        );
        assert_eq!(report.families, 5);
    }

    #[tokio::test]
    async fn test_bootstrap_without_hosts_is_fatal() {
        let api = FakeApi::scenario();
        *api.hosts.lock() = Some(Vec::new());
        let registry = MetricRegistry::new("rhev");
        let err = registry.bootstrap(&api, &CollectionOptions::default()).await.unwrap_err();
        assert!(matches!(err, ExporterError::Bootstrap { .. }));
        assert!(!err.is_recoverable());
    }

    #[tokio::test]
    async fn test_bootstrap_host_fetch_failure_is_fatal() {
        let api = FakeApi::scenario();
        *api.hosts.lock() = None;
        let registry = MetricRegistry::new("rhev");
        let err = registry.bootstrap(&api, &CollectionOptions::default()).await.unwrap_err();
        assert_eq!(err.category(), "bootstrap");
    }

    #[tokio::test]
    async fn test_bootstrap_falls_back_to_per_host_statistics() {
        let api = FakeApi::scenario();
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts[0].statistics = None;
        }
        api.statistics
            .lock()
            .insert("h1".into(), vec![stat("memory.used", 1024.0)]);

        let registry = MetricRegistry::new("rhev");
        registry.bootstrap(&api, &CollectionOptions::default()).await.unwrap();

        assert!(api.calls().contains(&"/hosts/h1/statistics".to_string()));
        assert!(registry.family("memory.used", MetricScope::Host).is_some());
        assert!(registry.family("memory.used", MetricScope::Cluster).is_some());
    }

    #[tokio::test]
    async fn test_bootstrap_without_cluster_metrics() {
        let api = FakeApi::scenario();
        let options = CollectionOptions {
            cluster_metrics: false,
            ..CollectionOptions::default()
        };
        let registry = MetricRegistry::new("rhev");
        registry.bootstrap(&api, &options).await.unwrap();

        assert_eq!(
            registry.series_names(),
            vec!["rhev_host_activevms", "rhev_host_cpu_load_avg", "rhev_host_up"]
        );
    }

    // ------------------------------------------------------------------------
    // Cycles
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_end_to_end_cycle() {
        let api = Arc::new(FakeApi::scenario());
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let report = aggregator.run_cycle().await;

        assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostA"), Some(1.0));
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostA"), Some(0.42));
        assert_eq!(host_value(&registry, "rhev_host_activevms", "Prod", "hostA"), Some(1.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_cpu_load_avg", "Prod"), Some(0.42));
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Prod"), Some(1.0));

        assert_eq!(report.hosts, 1);
        assert_eq!(report.host_series, 3);
        assert_eq!(report.cluster_series, 2);
        assert_eq!(report.new_families, 0);
        assert!(report.is_clean());
        assert_eq!(aggregator.cycles(), 1);
        assert_eq!(aggregator.topology().cluster_count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_cluster_uses_empty_label() {
        let api = Arc::new(FakeApi::scenario());
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts.push(host("h2", "hostB", "c-missing", "up", vec![stat("cpu.load.avg", 0.1)]));
        }
        *api.vms.lock() = Some(vec![vm("v1", Some("h1")), vm("v2", Some("h2"))]);
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let report = aggregator.run_cycle().await;

        assert!(report.is_clean());
        assert_eq!(host_value(&registry, "rhev_host_up", "", "hostB"), Some(1.0));
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "", "hostB"), Some(0.1));
        assert_eq!(host_value(&registry, "rhev_host_activevms", "", "hostB"), Some(1.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_cpu_load_avg", ""), Some(0.1));
        assert_eq!(cluster_value(&registry, "rhev_cluster_cpu_load_avg", "Prod"), Some(0.42));
    }

    #[tokio::test]
    async fn test_vm_listing_failure_zeroes_vm_counts() {
        let api = Arc::new(FakeApi::scenario());
        *api.vms.lock() = None;
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let report = aggregator.run_cycle().await;

        assert_eq!(report.fetch_failures, 1);
        assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostA"), Some(1.0));
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostA"), Some(0.42));
        assert_eq!(host_value(&registry, "rhev_host_activevms", "Prod", "hostA"), Some(0.0));
    }

    #[tokio::test]
    async fn test_consecutive_cycles_are_idempotent() {
        let api = Arc::new(FakeApi::scenario());
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts.push(host("h2", "hostB", "c1", "up", vec![stat("cpu.load.avg", 0.58)]));
        }
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        aggregator.run_cycle().await;
        let first = registry.encode_text().unwrap();
        aggregator.run_cycle().await;
        let second = registry.encode_text().unwrap();

        assert_eq!(first, second);
        assert_eq!(cluster_value(&registry, "rhev_cluster_cpu_load_avg", "Prod"), Some(0.42 + 0.58));
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Prod"), Some(2.0));
    }

    #[tokio::test]
    async fn test_active_hosts_counts_only_up_hosts() {
        let api = Arc::new(FakeApi::scenario());
        *api.clusters.lock() = Some(vec![
            cluster("c1", "Prod"),
            cluster("c2", "Dev"),
            cluster("c3", "Empty"),
        ]);
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts.push(host("h2", "hostB", "c2", "maintenance", vec![stat("cpu.load.avg", 0.0)]));
        }
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        aggregator.run_cycle().await;

        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Prod"), Some(1.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Dev"), Some(0.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Empty"), Some(0.0));
        assert_eq!(host_value(&registry, "rhev_host_up", "Dev", "hostB"), Some(0.0));

        // Host goes up on the next cycle
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts[1].status = Some(HostStatus { state: Some("up".into()), text: None });
        }
        aggregator.run_cycle().await;
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Dev"), Some(1.0));
        assert_eq!(host_value(&registry, "rhev_host_up", "Dev", "hostB"), Some(1.0));
    }

    #[tokio::test]
    async fn test_new_statistic_is_registered_lazily() {
        let api = Arc::new(FakeApi::scenario());
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;
        assert!(registry.family("swap.used", MetricScope::Host).is_none());

        if let Some(hosts) = api.hosts.lock().as_mut() {
            if let Some(list) = hosts[0].statistics.as_mut() {
                list.statistics.push(stat("swap.used", 2048.0));
            }
        }
        let report = aggregator.run_cycle().await;

        assert_eq!(report.new_families, 2);
        assert!(report.is_clean());
        assert_eq!(host_value(&registry, "rhev_host_swap_used", "Prod", "hostA"), Some(2048.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_swap_used", "Prod"), Some(2048.0));
    }

    #[tokio::test]
    async fn test_statistic_without_value_is_registered_but_not_set() {
        let api = Arc::new(FakeApi::scenario());
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let mut empty = stat("boot.time", 0.0);
        empty.values = None;
        if let Some(hosts) = api.hosts.lock().as_mut() {
            if let Some(list) = hosts[0].statistics.as_mut() {
                list.statistics.push(empty);
            }
        }
        let report = aggregator.run_cycle().await;

        assert!(registry.family("boot.time", MetricScope::Host).is_some());
        assert_eq!(host_value(&registry, "rhev_host_boot_time", "Prod", "hostA"), None);
        assert_eq!(report.host_series, 3);
    }

    #[tokio::test]
    async fn test_per_host_statistics_strategy() {
        let api = Arc::new(FakeApi::scenario());
        if let Some(hosts) = api.hosts.lock().as_mut() {
            hosts.push(host("h2", "hostB", "c1", "up", Vec::new()));
        }
        api.statistics
            .lock()
            .insert("h1".into(), vec![stat("cpu.load.avg", 0.75)]);
        let options = CollectionOptions {
            inline_statistics: false,
            ..CollectionOptions::default()
        };
        let (registry, mut aggregator) = bootstrapped(&api, options).await;

        let report = aggregator.run_cycle().await;

        // h2 has no per-host statistics resource: one failure, up still published
        assert_eq!(report.fetch_failures, 1);
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostA"), Some(0.75));
        assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostB"), Some(1.0));
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostB"), None);
        assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Prod"), Some(2.0));

        let calls = api.calls();
        assert!(calls.contains(&"/hosts/h1/statistics".to_string()));
        assert!(calls.contains(&"/hosts/h2/statistics".to_string()));
    }

    #[tokio::test]
    async fn test_excluded_statistics_are_skipped() {
        let api = Arc::new(FakeApi::scenario());
        if let Some(hosts) = api.hosts.lock().as_mut() {
            if let Some(list) = hosts[0].statistics.as_mut() {
                list.statistics.push(stat("ksm.cpu.current", 3.0));
            }
        }
        let options = CollectionOptions::default().with_exclusions(&["^ksm\\."]).unwrap();
        let (registry, mut aggregator) = bootstrapped(&api, options).await;

        aggregator.run_cycle().await;

        assert!(registry.family("ksm.cpu.current", MetricScope::Host).is_none());
        assert!(registry.family("ksm.cpu.current", MetricScope::Cluster).is_none());
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostA"), Some(0.42));
    }

    #[tokio::test]
    async fn test_statistics_named_like_fixed_families_are_not_exported() {
        let api = Arc::new(FakeApi::scenario());
        if let Some(hosts) = api.hosts.lock().as_mut() {
            if let Some(list) = hosts[0].statistics.as_mut() {
                list.statistics.push(stat("up", 86400.0));
                list.statistics.push(stat("activevms", 7.0));
                list.statistics.push(stat("activehosts", 5.0));
            }
        }
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        for _ in 0..2 {
            let report = aggregator.run_cycle().await;
            assert!(report.is_clean());
            assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostA"), Some(1.0));
            assert_eq!(host_value(&registry, "rhev_host_activevms", "Prod", "hostA"), Some(1.0));
            assert_eq!(cluster_value(&registry, "rhev_cluster_activehosts", "Prod"), Some(1.0));
        }
        // Only the cluster scope reserves `activehosts`
        assert_eq!(host_value(&registry, "rhev_host_activehosts", "Prod", "hostA"), Some(5.0));
        assert_eq!(aggregator.reserved_warned.len(), 3);
    }

    #[tokio::test]
    async fn test_colliding_statistics_sum_once_per_host() {
        let api = Arc::new(FakeApi::default());
        *api.clusters.lock() = Some(vec![cluster("c1", "Prod")]);
        *api.hosts.lock() = Some(vec![
            host("h1", "hostA", "c1", "up", vec![stat("cpu.load", 1.0), stat("cpu_load", 2.0)]),
            host("h2", "hostB", "c1", "up", vec![stat("cpu_load", 3.0), stat("cpu.load", 4.0)]),
        ]);
        *api.vms.lock() = Some(Vec::new());
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let report = aggregator.run_cycle().await;
        let first = registry.encode_text().unwrap();
        aggregator.run_cycle().await;

        assert!(report.is_clean());
        assert_eq!(host_value(&registry, "rhev_host_cpu_load", "Prod", "hostA"), Some(2.0));
        assert_eq!(host_value(&registry, "rhev_host_cpu_load", "Prod", "hostB"), Some(4.0));
        assert_eq!(cluster_value(&registry, "rhev_cluster_cpu_load", "Prod"), Some(6.0));
        // cpu_load plus activehosts
        assert_eq!(report.cluster_series, 2);
        assert_eq!(registry.encode_text().unwrap(), first);
    }

    #[tokio::test]
    async fn test_outage_keeps_last_published_values() {
        let api = Arc::new(FakeApi::scenario());
        let (registry, mut aggregator) = bootstrapped(&api, CollectionOptions::default()).await;
        aggregator.run_cycle().await;
        let before = registry.encode_text().unwrap();

        *api.clusters.lock() = None;
        *api.hosts.lock() = None;
        *api.vms.lock() = None;
        let report = aggregator.run_cycle().await;

        assert_eq!(report.fetch_failures, 3);
        assert_eq!(report.hosts, 0);
        assert_eq!(report.host_series, 0);
        assert_eq!(report.cluster_series, 0);
        assert_eq!(registry.encode_text().unwrap(), before);
        assert_eq!(aggregator.topology().cluster_name_of("c1"), "Prod");
    }

    #[tokio::test]
    async fn test_cycle_without_bootstrap_reports_unregistered_writes() {
        let api = Arc::new(FakeApi::scenario());
        let registry = Arc::new(MetricRegistry::new("rhev"));
        let mut aggregator = Aggregator::new(api.clone(), Arc::clone(&registry), CollectionOptions::default());

        let report = aggregator.run_cycle().await;

        // up, activevms and activehosts were never ensured
        assert_eq!(report.registry_errors, 3);
        assert_eq!(host_value(&registry, "rhev_host_cpu_load_avg", "Prod", "hostA"), Some(0.42));

        registry.ensure_fixed_families(true).unwrap();
        let report = aggregator.run_cycle().await;
        assert!(report.is_clean());
        assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostA"), Some(1.0));
    }

    // ------------------------------------------------------------------------
    // Poller
    // ------------------------------------------------------------------------

    #[tokio::test]
    async fn test_poller_runs_until_cancelled() {
        let api = Arc::new(FakeApi::scenario());
        let shutdown = CancellationToken::new();
        *api.cancel_after_vm_calls.lock() = Some((3, shutdown.clone()));
        let (registry, aggregator) = bootstrapped(&api, CollectionOptions::default()).await;

        let cycles = Poller::new(aggregator, Duration::from_millis(5))
            .run(shutdown)
            .await;

        assert_eq!(cycles, 3);
        assert_eq!(api.calls().iter().filter(|c| c.as_str() == "/clusters").count(), 3);
        assert_eq!(host_value(&registry, "rhev_host_up", "Prod", "hostA"), Some(1.0));
    }

    #[tokio::test]
    async fn test_poller_cancelled_before_start() {
        let api = Arc::new(FakeApi::scenario());
        let (_registry, aggregator) = bootstrapped(&api, CollectionOptions::default()).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        let cycles = Poller::new(aggregator, Duration::from_secs(3600)).run(shutdown).await;
        assert_eq!(cycles, 0);
    }

    #[tokio::test]
    async fn test_poller_stops_during_sleep() {
        let api = Arc::new(FakeApi::scenario());
        let (_registry, aggregator) = bootstrapped(&api, CollectionOptions::default()).await;
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(Poller::new(aggregator, Duration::from_secs(3600)).run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown.cancel();

        let cycles = tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cycles, 1);
    }
}

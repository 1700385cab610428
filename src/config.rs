use axum::extract::Request;
use axum::http::{HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use clap::Parser;
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::limiter::RejectReason;

// Builds the response sent back for a rejected request
pub type RejectHandler = Arc<dyn Fn(RejectReason, &Request) -> Response + Send + Sync>;

pub const DEFAULT_PROXY_HEADER: &str = "x-real-ip";

// CLI argument structure
#[derive(Parser, Debug, Clone)]
#[command(name = "admission-gateway")]
#[command(about = "Per-address admission control in front of an HTTP upstream")]
pub struct Args {
    // Port to run the server on
    #[arg(short, long, default_value_t = 8080)]
    pub port: u16,

    // Upstream every admitted request is forwarded to
    #[arg(short, long, default_value = "http://localhost:3000")]
    pub upstream: String,

    // JSON options object; replaces the limit flags below when given
    #[arg(long)]
    pub config: Option<PathBuf>,

    // Take the client address from --proxy-header instead of the socket
    #[arg(long)]
    pub proxy: bool,

    #[arg(long, default_value = DEFAULT_PROXY_HEADER)]
    pub proxy_header: String,

    // Request counting window in milliseconds
    #[arg(long, default_value_t = 30_000)]
    pub interval_ms: u64,

    // Max requests per address per window
    #[arg(long, default_value_t = 1000)]
    pub limit: u64,

    // Max non-200/304 responses per address per window (0 disables)
    #[arg(long, default_value_t = 50)]
    pub failure_limit: u64,

    // Min delay between two hits on the same path in milliseconds (0 disables)
    #[arg(long, default_value_t = 1000)]
    pub refresh_interval_ms: u64,

    // Max open connections per address
    #[arg(long, default_value_t = 100)]
    pub connections: u64,

    #[arg(long, default_value = "info")]
    pub log_level: tracing::Level,
}

impl Args {
    pub fn limiter_config(&self) -> Result<LimiterConfig> {
        if let Some(path) = &self.config {
            let raw = std::fs::read_to_string(path)?;
            return LimiterConfig::from_value(serde_json::from_str(&raw)?);
        }

        let proxy_header = HeaderName::try_from(self.proxy_header.as_str())
            .map_err(|e| Error::config(format!("invalid proxy header {:?}: {}", self.proxy_header, e)))?;

        Ok(LimiterConfig {
            proxy: self.proxy,
            proxy_header,
            interval: Duration::from_millis(self.interval_ms),
            limit: self.limit,
            failure_limit: self.failure_limit,
            refresh_interval: Duration::from_millis(self.refresh_interval_ms),
            connections: self.connections,
            ..Default::default()
        })
    }
}

/// Settings of one admission filter. Immutable once the filter is built.
#[derive(Clone)]
pub struct LimiterConfig {
    /// Resolve clients from `proxy_header` rather than the peer address
    pub proxy: bool,
    pub proxy_header: HeaderName,
    /// Request counting window; also the eviction sweep period
    pub interval: Duration,
    /// Requests allowed per window
    pub limit: u64,
    /// Failed responses allowed per window, 0 disables the check
    pub failure_limit: u64,
    /// Same-path revisits closer than this are rejected, zero disables the check
    pub refresh_interval: Duration,
    /// Concurrent connections allowed per address
    pub connections: u64,
    pub reject_handler: RejectHandler,
}

impl LimiterConfig {
    /// Reads an options object such as
    /// `{"interval": 30000, "limit": 1000, "connections": 100}`.
    ///
    /// Missing, negative or mistyped values fall back to their defaults.
    /// Anything other than an object, null included, is rejected; use
    /// [`LimiterConfig::default`] when there are no options.
    pub fn from_value(value: Value) -> Result<Self> {
        let options = match value {
            Value::Object(options) => options,
            other => {
                return Err(Error::config(format!(
                    "options must be a JSON object, got {}",
                    kind_of(&other)
                )));
            }
        };
        let defaults = LimiterConfig::default();

        let proxy_header = options
            .get("proxyHeader")
            .and_then(Value::as_str)
            .and_then(|name| HeaderName::try_from(name).ok())
            .unwrap_or(defaults.proxy_header);

        Ok(LimiterConfig {
            proxy: flag(&options, "proxy", defaults.proxy),
            proxy_header,
            interval: millis(&options, "interval", defaults.interval),
            limit: number(&options, "limit", defaults.limit),
            failure_limit: number(&options, "failureLimit", defaults.failure_limit),
            refresh_interval: millis(&options, "refreshInterval", defaults.refresh_interval),
            connections: number(&options, "connections", defaults.connections),
            reject_handler: defaults.reject_handler,
        })
    }

    pub fn with_reject_handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(RejectReason, &Request) -> Response + Send + Sync + 'static,
    {
        self.reject_handler = Arc::new(handler);
        self
    }
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            proxy: false,
            proxy_header: HeaderName::from_static(DEFAULT_PROXY_HEADER),
            interval: Duration::from_millis(30_000),
            limit: 1000,
            failure_limit: 50,
            refresh_interval: Duration::from_millis(1000),
            connections: 100,
            reject_handler: Arc::new(too_many_requests),
        }
    }
}

impl fmt::Debug for LimiterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimiterConfig")
            .field("proxy", &self.proxy)
            .field("proxy_header", &self.proxy_header)
            .field("interval", &self.interval)
            .field("limit", &self.limit)
            .field("failure_limit", &self.failure_limit)
            .field("refresh_interval", &self.refresh_interval)
            .field("connections", &self.connections)
            .finish_non_exhaustive()
    }
}

// Default reject handler
pub fn too_many_requests(_reason: RejectReason, _request: &Request) -> Response {
    (StatusCode::TOO_MANY_REQUESTS, "Too Many Requests.").into_response()
}

fn flag(options: &Map<String, Value>, key: &str, default: bool) -> bool {
    match options.get(key) {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|v| v != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(_)) | Some(Value::Object(_)) => true,
    }
}

fn number(options: &Map<String, Value>, key: &str, default: u64) -> u64 {
    let value = match options.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    match value {
        Some(v) if v.is_finite() && v >= 0.0 => v as u64,
        _ => default,
    }
}

fn millis(options: &Map<String, Value>, key: &str, default: Duration) -> Duration {
    let default_ms = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
    Duration::from_millis(number(options, key, default_ms))
}

fn kind_of(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_defaults() {
        let config = LimiterConfig::from_value(json!({})).unwrap();
        assert!(!config.proxy);
        assert_eq!(config.proxy_header, "x-real-ip");
        assert_eq!(config.interval, Duration::from_millis(30_000));
        assert_eq!(config.limit, 1000);
        assert_eq!(config.failure_limit, 50);
        assert_eq!(config.refresh_interval, Duration::from_millis(1000));
        assert_eq!(config.connections, 100);
    }

    #[test]
    fn test_invalid_values_fall_back_to_defaults() {
        let config = LimiterConfig::from_value(json!({
            "proxy": 1,
            "interval": -5,
            "limit": "250",
            "failureLimit": 0,
            "refreshInterval": [1],
            "connections": "many",
            "proxyHeader": "bad header",
        }))
        .unwrap();

        assert!(config.proxy);
        assert_eq!(config.interval, Duration::from_millis(30_000));
        assert_eq!(config.limit, 250);
        assert_eq!(config.failure_limit, 0);
        assert_eq!(config.refresh_interval, Duration::from_millis(1000));
        assert_eq!(config.connections, 100);
        assert_eq!(config.proxy_header, "x-real-ip");
    }

    #[test]
    fn test_non_object_options_are_rejected() {
        for value in [json!(null), json!(42), json!("proxy"), json!([1, 2]), json!(true)] {
            let err = LimiterConfig::from_value(value).unwrap_err();
            assert!(matches!(err, Error::Config(_)));
        }
    }

    #[test]
    fn test_args_build_config() {
        let args = Args::parse_from([
            "admission-gateway",
            "--proxy",
            "--proxy-header",
            "x-forwarded-for",
            "--interval-ms",
            "500",
            "--connections",
            "2",
            "--refresh-interval-ms",
            "0",
        ]);
        let config = args.limiter_config().unwrap();

        assert!(config.proxy);
        assert_eq!(config.proxy_header, "x-forwarded-for");
        assert_eq!(config.interval, Duration::from_millis(500));
        assert_eq!(config.connections, 2);
        assert!(config.refresh_interval.is_zero());
        assert_eq!(config.limit, 1000);
    }

    #[test]
    fn test_args_reject_invalid_header() {
        let args = Args::parse_from(["admission-gateway", "--proxy-header", "not a header"]);
        assert!(matches!(args.limiter_config(), Err(Error::Config(_))));
    }

    #[test]
    fn test_default_reject_handler() {
        let config = LimiterConfig::default();
        let request = Request::new(axum::body::Body::empty());
        let response = (config.reject_handler)(RejectReason::RequestLimit, &request);
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }
}

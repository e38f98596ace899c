//! # Error Handling Module
//!
//! This module defines every error the registry can surface to an embedder, built on
//! the `thiserror` crate. Boundary operations (`register`, `deregister`, `discover`,
//! selection) return these errors by value; probe failures never do. A failed probe is
//! classified as a [`ProbeError`] and recorded in the instance's health status instead.
//!
//! ## Error Families
//!
//! - [`ValidationError`]: a descriptor or one of its parts broke a naming rule. It is
//!   wrapped into [`RegistryError::InvalidDescriptor`] at registration time.
//! - [`RegistryError`]: the taxonomy returned by backends, the discovery surface and
//!   the load balancer.
//! - [`ProbeError`]: the classification written into `HealthStatus::last_error`.
//!
//! The library is protocol-neutral, but the gateway host needs an HTTP mapping, so
//! [`RegistryError::status_code`] and an `IntoResponse` implementation live here too.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use std::error::Error as _;
use thiserror::Error;

/// Main result type used throughout the registry
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Errors produced by the naming and validation rules
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// Service name is empty, malformed, or missing the `-service` suffix
    #[error("invalid service name '{name}': {reason}")]
    InvalidName { name: String, reason: String },

    /// Service ID does not follow `{name}-{instance-token}`
    #[error("invalid service id '{id}': {reason}")]
    InvalidId { id: String, reason: String },

    /// A required `key:value` tag is absent
    #[error("missing required tag '{prefix}:<value>'")]
    MissingTag { prefix: String },

    /// A required metadata key is absent
    #[error("missing required metadata key '{key}'")]
    MissingMetadata { key: String },

    /// Version string is not `vMAJOR.MINOR.PATCH`
    #[error("invalid version '{version}', expected format v1.0.0")]
    InvalidVersion { version: String },

    /// Metadata `type` is outside the accepted service types
    #[error("invalid service type '{value}', accepted: {accepted}")]
    InvalidServiceType { value: String, accepted: String },

    /// Metadata `environment` is outside the accepted environments
    #[error("invalid environment '{value}', accepted: {accepted}")]
    InvalidEnvironment { value: String, accepted: String },

    /// Port outside 1..=65535
    #[error("invalid port {port}")]
    InvalidPort { port: u32 },

    /// Address is empty or contains whitespace
    #[error("invalid address '{address}'")]
    InvalidAddress { address: String },

    /// Health path does not start with '/'
    #[error("invalid health path '{path}', it must start with '/'")]
    InvalidHealthPath { path: String },
}

/// Error taxonomy of the registry
#[derive(Debug, Error, Clone)]
pub enum RegistryError {
    /// Validation failed at registration time
    #[error("invalid descriptor: {0}")]
    InvalidDescriptor(#[from] ValidationError),

    /// The id is already registered
    #[error("service id already registered: {id}")]
    DuplicateId { id: String },

    /// The id or name is absent
    #[error("not found: {what}")]
    NotFound { what: String },

    /// The discovery agent timed out, refused, or answered non-2xx
    #[error("registry backend unavailable: {reason}")]
    BackendUnavailable { reason: String },

    /// Selection found no healthy instance of the service
    #[error("no healthy instance of service '{service}'")]
    NoHealthyInstance { service: String },

    /// The backend does not support the operation
    #[error("operation not supported by the {backend} backend: {operation}")]
    Unsupported { backend: String, operation: String },

    /// Unknown load-balancing strategy name
    #[error("unknown load balancing strategy: {name}")]
    InvalidStrategy { name: String },

    /// Weights must be positive
    #[error("invalid weight {weight} for '{id}': weights must be positive")]
    InvalidWeight { id: String, weight: i64 },

    /// Configuration problems found at startup
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// The process-wide registry was initialised twice
    #[error("global registry already initialized")]
    AlreadyInitialized,
}

impl RegistryError {
    /// Create a not found error
    pub fn not_found<S: Into<String>>(what: S) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a backend unavailable error annotated with the underlying reason
    pub fn backend_unavailable<S: Into<String>>(reason: S) -> Self {
        Self::BackendUnavailable {
            reason: reason.into(),
        }
    }

    /// Create a configuration error
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a no-healthy-instance error for a service
    pub fn no_healthy_instance<S: Into<String>>(service: S) -> Self {
        Self::NoHealthyInstance {
            service: service.into(),
        }
    }

    /// HTTP status an embedder should answer with when this error reaches a client
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidDescriptor(_) => StatusCode::BAD_REQUEST,
            Self::DuplicateId { .. } => StatusCode::CONFLICT,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::BackendUnavailable { .. } => StatusCode::BAD_GATEWAY,
            Self::NoHealthyInstance { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Unsupported { .. } => StatusCode::NOT_IMPLEMENTED,
            Self::InvalidStrategy { .. } => StatusCode::BAD_REQUEST,
            Self::InvalidWeight { .. } => StatusCode::BAD_REQUEST,
            Self::Configuration { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AlreadyInitialized => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Whether the caller may retry after a short backoff
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::BackendUnavailable { .. } | Self::NoHealthyInstance { .. }
        )
    }

    /// Stable machine-readable label for API payloads and log fields
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::InvalidDescriptor(_) => "invalid_descriptor",
            Self::DuplicateId { .. } => "duplicate_id",
            Self::NotFound { .. } => "not_found",
            Self::BackendUnavailable { .. } => "backend_unavailable",
            Self::NoHealthyInstance { .. } => "no_healthy_instance",
            Self::Unsupported { .. } => "unsupported",
            Self::InvalidStrategy { .. } => "invalid_strategy",
            Self::InvalidWeight { .. } => "invalid_weight",
            Self::Configuration { .. } => "configuration_error",
            Self::AlreadyInitialized => "already_initialized",
        }
    }
}

impl From<reqwest::Error> for RegistryError {
    fn from(err: reqwest::Error) -> Self {
        Self::BackendUnavailable {
            reason: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for RegistryError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Configuration {
            message: format!("failed to parse config: {}", err),
        }
    }
}

impl From<std::io::Error> for RegistryError {
    fn from(err: std::io::Error) -> Self {
        Self::Configuration {
            message: format!("failed to read config: {}", err),
        }
    }
}

impl IntoResponse for RegistryError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let request_id = uuid::Uuid::new_v4().to_string();

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
                "retryable": self.is_retryable(),
                "request_id": request_id,
            }
        });

        (status, Json(body)).into_response()
    }
}

/// Classification of a failed health probe
///
/// The `Display` output is the exact label stored in `HealthStatus::last_error`.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProbeError {
    #[error("ConnectionRefused")]
    ConnectionRefused,

    #[error("ConnectionTimeout")]
    ConnectionTimeout,

    #[error("DNSError")]
    DnsError,

    #[error("TLSError")]
    TlsError,

    #[error("HTTP{0}")]
    Http(u16),

    #[error("ProbeBodyInvalid")]
    ProbeBodyInvalid,
}

impl ProbeError {
    /// Classify a transport error returned by the HTTP client
    ///
    /// reqwest only exposes timeouts and connect failures as flags, so the source
    /// chain is walked to tell DNS, TLS and refused connections apart. The walk starts
    /// below the top-level error, whose message embeds the request URL.
    pub fn from_transport(err: &reqwest::Error) -> Self {
        if err.is_timeout() {
            return Self::ConnectionTimeout;
        }

        let causes: Vec<&(dyn std::error::Error + 'static)> =
            std::iter::successors(err.source(), |&cause| cause.source()).collect();

        for cause in &causes {
            if let Some(io) = cause.downcast_ref::<std::io::Error>() {
                match io.kind() {
                    std::io::ErrorKind::ConnectionRefused => return Self::ConnectionRefused,
                    std::io::ErrorKind::TimedOut => return Self::ConnectionTimeout,
                    _ => {}
                }
            }
        }

        // Innermost first, the root cause carries the most specific message.
        for cause in causes.iter().rev() {
            let text = cause.to_string().to_lowercase();
            if text.contains("dns") || text.contains("lookup") || text.contains("resolve") {
                return Self::DnsError;
            }
            if text.contains("tls") || text.contains("ssl") || text.contains("certificate") {
                return Self::TlsError;
            }
            if text.contains("timed out") {
                return Self::ConnectionTimeout;
            }
        }

        if err.is_body() || err.is_decode() {
            Self::ProbeBodyInvalid
        } else {
            Self::ConnectionRefused
        }
    }
}

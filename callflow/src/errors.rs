//! Error types for the callflow framework.
//!
//! Every public operation reports failures as a structured [`CallError`]
//! carrying a machine-readable [`ErrorCode`] and a human-readable message.
//! Layer-specific errors convert into the crate-level [`CallflowError`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use thiserror::Error;

/// The main error type for callflow operations.
#[derive(Debug, Error)]
pub enum CallflowError {
    /// A service or method call failed.
    #[error("{0}")]
    Call(#[from] CallError),

    /// A pipeline definition failed validation.
    #[error("{0}")]
    Definition(#[from] DefinitionError),

    /// A condition expression could not be parsed or evaluated.
    #[error("{0}")]
    Expression(#[from] ExpressionError),

    /// Authentication failed.
    #[error("{0}")]
    Auth(#[from] AuthError),

    /// The HTTP transport failed.
    #[error("{0}")]
    Transport(#[from] TransportError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A generic internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Machine-readable error category.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// No service is registered under the requested id.
    ServiceNotFound,
    /// The service has no method with the requested name.
    MethodNotFound,
    /// Generic execution failure.
    ExecutionError,
    /// The chain-execution collaborator failed.
    ChainExecutionFailed,
    /// The request or step input was malformed.
    InvalidInput,
    /// A circuit breaker rejected the call.
    CircuitOpen,
    /// The call or step exceeded its time budget.
    Timeout,
    /// Credentials could not be obtained or were rejected.
    AuthenticationFailed,
    /// A response failed caller-supplied validation.
    ValidationFailed,
    /// A remote endpoint answered with a non-success status.
    HttpError,
    /// The operation was cancelled.
    Cancelled,
    /// Service registration was rejected.
    RegistrationFailed,
}

impl ErrorCode {
    /// Returns the wire representation of the code.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ServiceNotFound => "SERVICE_NOT_FOUND",
            Self::MethodNotFound => "METHOD_NOT_FOUND",
            Self::ExecutionError => "EXECUTION_ERROR",
            Self::ChainExecutionFailed => "CHAIN_EXECUTION_FAILED",
            Self::InvalidInput => "INVALID_INPUT",
            Self::CircuitOpen => "CIRCUIT_OPEN",
            Self::Timeout => "TIMEOUT",
            Self::AuthenticationFailed => "AUTHENTICATION_FAILED",
            Self::ValidationFailed => "VALIDATION_FAILED",
            Self::HttpError => "HTTP_ERROR",
            Self::Cancelled => "CANCELLED",
            Self::RegistrationFailed => "REGISTRATION_FAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured error carried in call and step result envelopes.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{code}: {message}")]
pub struct CallError {
    /// Error category.
    pub code: ErrorCode,
    /// Human-readable message.
    pub message: String,
    /// Additional details.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub details: HashMap<String, serde_json::Value>,
}

impl CallError {
    /// Creates a new call error.
    #[must_use]
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: HashMap::new(),
        }
    }

    /// Adds a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details.insert(key.into(), value);
        self
    }

    /// Creates a service-not-found error.
    #[must_use]
    pub fn service_not_found(service_id: &str) -> Self {
        Self::new(
            ErrorCode::ServiceNotFound,
            format!("Service '{service_id}' is not registered"),
        )
        .with_detail("service_id", serde_json::json!(service_id))
    }

    /// Creates a method-not-found error.
    #[must_use]
    pub fn method_not_found(service_id: &str, method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("Service '{service_id}' has no method '{method}'"),
        )
        .with_detail("service_id", serde_json::json!(service_id))
        .with_detail("method", serde_json::json!(method))
    }

    /// Creates a generic execution error.
    #[must_use]
    pub fn execution(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::ExecutionError, message)
    }

    /// Creates an invalid-input error.
    #[must_use]
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InvalidInput, message)
    }

    /// Creates a circuit-open error.
    #[must_use]
    pub fn circuit_open(key: &str) -> Self {
        Self::new(ErrorCode::CircuitOpen, format!("Circuit breaker is open for '{key}'"))
            .with_detail("key", serde_json::json!(key))
    }

    /// Creates a timeout error.
    #[must_use]
    pub fn timeout(what: &str, timeout_ms: u64) -> Self {
        Self::new(ErrorCode::Timeout, format!("{what} timed out after {timeout_ms}ms"))
            .with_detail("timeout_ms", serde_json::json!(timeout_ms))
    }

    /// Creates a cancellation error.
    #[must_use]
    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, reason)
    }

    /// Converts to a dictionary representation.
    #[must_use]
    pub fn to_dict(&self) -> HashMap<String, serde_json::Value> {
        let mut map = HashMap::new();
        map.insert("code".to_string(), serde_json::json!(self.code.as_str()));
        map.insert("message".to_string(), serde_json::json!(self.message));
        if !self.details.is_empty() {
            let details: serde_json::Map<String, serde_json::Value> = self
                .details
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            map.insert("details".to_string(), serde_json::Value::Object(details));
        }
        map
    }
}

impl From<AuthError> for CallError {
    fn from(err: AuthError) -> Self {
        Self::new(ErrorCode::AuthenticationFailed, err.to_string())
    }
}

impl From<TransportError> for CallError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::Timeout { timeout_ms } => Self::timeout("HTTP request", timeout_ms),
            TransportError::Cancelled(reason) => Self::cancelled(reason),
            other => Self::execution(other.to_string()),
        }
    }
}

/// Error raised when a pipeline definition is invalid.
#[derive(Debug, Clone, Error)]
#[error("{message}")]
pub struct DefinitionError {
    /// The error message.
    pub message: String,
    /// The steps involved in the error.
    pub steps: Vec<String>,
}

impl DefinitionError {
    /// Creates a new definition error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            steps: Vec::new(),
        }
    }

    /// Sets the steps involved.
    #[must_use]
    pub fn with_steps(mut self, steps: Vec<String>) -> Self {
        self.steps = steps;
        self
    }
}

impl From<DefinitionError> for CallError {
    fn from(err: DefinitionError) -> Self {
        Self::invalid_input(err.message).with_detail("steps", serde_json::json!(err.steps))
    }
}

/// Errors from parsing or evaluating condition expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExpressionError {
    /// The expression text could not be tokenized or parsed.
    #[error("Invalid expression at position {position}: {reason}")]
    Syntax {
        /// Byte offset of the problem.
        position: usize,
        /// What went wrong.
        reason: String,
    },

    /// The expression nests deeper than allowed.
    #[error("Expression exceeds maximum nesting depth of {max}")]
    TooDeep {
        /// The depth limit.
        max: usize,
    },

    /// Operands could not be compared.
    #[error("Cannot compare {left} with {right}")]
    Incomparable {
        /// Left operand type.
        left: String,
        /// Right operand type.
        right: String,
    },
}

/// Errors raised while obtaining credentials.
#[derive(Debug, Clone, Error)]
pub enum AuthError {
    /// Required credentials are missing from the configuration.
    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    /// The token provider failed to produce a token.
    #[error("Token refresh failed: {0}")]
    RefreshFailed(String),
}

/// Errors raised by an HTTP transport.
#[derive(Debug, Clone, Error)]
pub enum TransportError {
    /// The request could not be built.
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// A connection or protocol error occurred.
    #[error("Network error: {0}")]
    Network(String),

    /// The request exceeded its timeout.
    #[error("Request timed out after {timeout_ms}ms")]
    Timeout {
        /// The timeout that elapsed.
        timeout_ms: u64,
    },

    /// The request was cancelled before completing.
    #[error("Request cancelled: {0}")]
    Cancelled(String),

    /// The response body could not be decoded.
    #[error("Invalid response body: {0}")]
    Decode(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_wire_format() {
        let json = serde_json::to_string(&ErrorCode::ServiceNotFound).unwrap();
        assert_eq!(json, r#""SERVICE_NOT_FOUND""#);
        assert_eq!(ErrorCode::CircuitOpen.to_string(), "CIRCUIT_OPEN");

        let parsed: ErrorCode = serde_json::from_str(r#""CHAIN_EXECUTION_FAILED""#).unwrap();
        assert_eq!(parsed, ErrorCode::ChainExecutionFailed);
    }

    #[test]
    fn test_call_error_to_dict() {
        let err = CallError::method_not_found("search", "query");
        let dict = err.to_dict();

        assert_eq!(dict.get("code").unwrap(), "METHOD_NOT_FOUND");
        assert!(dict.get("message").unwrap().as_str().unwrap().contains("query"));
        assert_eq!(dict["details"]["service_id"], "search");
    }

    #[test]
    fn test_transport_error_conversion() {
        let err: CallError = TransportError::Timeout { timeout_ms: 250 }.into();
        assert_eq!(err.code, ErrorCode::Timeout);

        let err: CallError = TransportError::Network("connection reset".into()).into();
        assert_eq!(err.code, ErrorCode::ExecutionError);
        assert!(err.message.contains("connection reset"));
    }

    #[test]
    fn test_definition_error_conversion() {
        let err = DefinitionError::new("Unknown dependency").with_steps(vec!["b".into()]);
        let call: CallError = err.into();
        assert_eq!(call.code, ErrorCode::InvalidInput);
        assert_eq!(call.details["steps"], serde_json::json!(["b"]));
    }

    #[test]
    fn test_callflow_error_display() {
        let err = CallflowError::from(CallError::circuit_open("https://api.example.com"));
        assert!(err.to_string().contains("CIRCUIT_OPEN"));
    }
}

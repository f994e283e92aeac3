//! The `error` module defines the bus-wide error taxonomy.
//!
//! None of these errors propagate as `Err` back through `publish`; a
//! producer is never made to handle a delivery failure synchronously.
//! Instead every error is converted to an [`ErrorEvent`] and pushed onto the
//! bus's error stream (see `Bus::on_error`), where host applications can
//! observe drops, bad patterns, and handler failures without special-casing
//! their control flow. The single caller-visible failure mode is
//! [`BusError::RequestTimeout`], returned by `Bus::request`.

use serde_json::Value;
use thiserror::Error;

/// Errors raised anywhere inside the bus or the routing engine.
#[derive(Debug, Error, Clone)]
pub enum BusError {
    /// The message failed validation (bad topic, unserializable or oversized
    /// payload, oversized message). The message was dropped.
    #[error("invalid message: {reason}")]
    MessageInvalid { reason: String },

    /// The publishing client exceeded its per-second ceiling. The message
    /// was dropped.
    #[error("rate limit exceeded for client `{client_id}`")]
    RateLimitExceeded { client_id: String },

    /// A subscription pattern could not be parsed.
    #[error("invalid pattern `{pattern}`: {reason}")]
    PatternInvalid { pattern: String, reason: String },

    /// A route failed to compile at add/update time (bad regex, malformed
    /// predicate tree, invalid topic pattern in the match block).
    #[error("invalid route: {reason}")]
    RouteInvalid { reason: String },

    /// A route referenced a transform function that was never registered.
    #[error("transform function `{name}` is not registered")]
    TransformFunctionNotFound { name: String },

    /// A CALL action referenced a handler that was never registered.
    #[error("action handler `{name}` is not registered")]
    ActionHandlerNotFound { name: String },

    /// A subscriber handler or a route action failed during execution.
    #[error("handler failed: {detail}")]
    HandlerThrew { detail: String },

    /// No reply arrived on the reply topic within the request timeout.
    #[error("request on `{topic}` timed out")]
    RequestTimeout { topic: String },

    /// A route id was not found in the route table.
    #[error("no route with id `{id}`")]
    RouteNotFound { id: String },
}

impl BusError {
    /// Stable machine-readable code for this error, carried on the error
    /// stream so listeners can dispatch without string matching.
    pub fn code(&self) -> &'static str {
        match self {
            BusError::MessageInvalid { .. } => "MESSAGE_INVALID",
            BusError::RateLimitExceeded { .. } => "RATE_LIMIT_EXCEEDED",
            BusError::PatternInvalid { .. } => "PATTERN_INVALID",
            BusError::RouteInvalid { .. } => "ROUTE_INVALID",
            BusError::TransformFunctionNotFound { .. } => "TRANSFORM_FN_NOT_FOUND",
            BusError::ActionHandlerNotFound { .. } => "ACTION_HANDLER_NOT_FOUND",
            BusError::HandlerThrew { .. } => "HANDLER_THREW",
            BusError::RequestTimeout { .. } => "REQUEST_TIMEOUT",
            BusError::RouteNotFound { .. } => "ROUTE_NOT_FOUND",
        }
    }

    /// Structured details attached to the error event, if any.
    pub fn details(&self) -> Option<Value> {
        match self {
            BusError::RateLimitExceeded { client_id } => {
                Some(serde_json::json!({ "client_id": client_id }))
            }
            BusError::PatternInvalid { pattern, .. } => {
                Some(serde_json::json!({ "pattern": pattern }))
            }
            BusError::TransformFunctionNotFound { name }
            | BusError::ActionHandlerNotFound { name } => {
                Some(serde_json::json!({ "name": name }))
            }
            BusError::RequestTimeout { topic } => Some(serde_json::json!({ "topic": topic })),
            BusError::RouteNotFound { id } => Some(serde_json::json!({ "id": id })),
            _ => None,
        }
    }
}

/// The payload delivered to error-stream listeners.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub code: &'static str,
    pub message: String,
    pub details: Option<Value>,
}

impl From<&BusError> for ErrorEvent {
    fn from(err: &BusError) -> Self {
        Self {
            code: err.code(),
            message: err.to_string(),
            details: err.details(),
        }
    }
}

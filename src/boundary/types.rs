//! Call boundary types and error definitions.

use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::observability::CorrelationId;

/// Errors surfaced to the caller of `CallBoundary::invoke`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CallError {
    /// The channel's breaker denied the attempt and no fallback was supplied.
    #[error("circuit open for channel {channel}")]
    BreakerOpen { channel: String },

    /// The last attempt did not complete before its deadline.
    #[error("call on {channel} timed out after {timeout:?}")]
    CallTimeout { channel: String, timeout: Duration },

    /// The last attempt failed at the transport level.
    #[error("transport failure on {channel}: {message}")]
    TransportFailure { channel: String, message: String },

    /// The boundary is shutting down and accepts no new calls.
    #[error("call boundary is draining")]
    Draining,
}

impl CallError {
    /// Metric label for this error class.
    pub fn kind(&self) -> &'static str {
        match self {
            CallError::BreakerOpen { .. } => "breaker_open",
            CallError::CallTimeout { .. } => "call_timeout",
            CallError::TransportFailure { .. } => "transport_failure",
            CallError::Draining => "draining",
        }
    }
}

/// Failure reported by the underlying call.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        Self(e.to_string())
    }
}

/// Successful result of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallOutcome<T> {
    /// The underlying call completed.
    Completed(T),
    /// The call could not complete; the supplied fallback is returned instead.
    Fallback(T),
}

impl<T> CallOutcome<T> {
    pub fn into_inner(self) -> T {
        match self {
            CallOutcome::Completed(v) | CallOutcome::Fallback(v) => v,
        }
    }

    pub fn is_fallback(&self) -> bool {
        matches!(self, CallOutcome::Fallback(_))
    }
}

/// Per-invocation overrides. Unset fields use the boundary's configuration.
#[derive(Debug, Clone)]
pub struct InvokeOptions<T> {
    pub timeout: Option<Duration>,
    pub max_retries: Option<u32>,
    pub fallback: Option<T>,
    pub correlation_id: Option<CorrelationId>,
}

impl<T> Default for InvokeOptions<T> {
    fn default() -> Self {
        Self {
            timeout: None,
            max_retries: None,
            fallback: None,
            correlation_id: None,
        }
    }
}

impl<T> InvokeOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn max_retries(mut self, retries: u32) -> Self {
        self.max_retries = Some(retries);
        self
    }

    pub fn fallback(mut self, value: T) -> Self {
        self.fallback = Some(value);
        self
    }

    /// Propagate an upstream correlation ID instead of minting one.
    pub fn correlation_id(mut self, id: CorrelationId) -> Self {
        self.correlation_id = Some(id);
        self
    }
}

/// What the underlying call gets to see about its invocation.
#[derive(Debug, Clone)]
pub struct CallContext {
    pub correlation_id: CorrelationId,
    pub channel: String,
    /// 1-based attempt number.
    pub attempt: u32,
    pub timeout: Duration,
    /// Cancelled when the attempt times out or the boundary drains.
    /// Work spawned by the call must stop when it fires.
    pub cancellation: CancellationToken,
}

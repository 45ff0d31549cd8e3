//! Call boundary subsystem.
//!
//! Every call that leaves this process goes through `CallBoundary::invoke`,
//! which bounds it with a deadline, retries transient failures, and
//! short-circuits channels whose breaker is open.

pub mod invoker;
pub mod types;

pub use invoker::{CallBoundary, ChannelStats};
pub use types::{CallContext, CallError, CallOutcome, InvokeOptions, TransportError};

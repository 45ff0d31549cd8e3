//! Timeout enforcement with explicit cancellation.
//!
//! # Responsibilities
//! - Wrap a cross-boundary call with a deadline
//! - Tell the underlying operation to stop when the deadline passes
//!
//! # Design Decisions
//! - Uses Tokio's timeout facilities
//! - The call receives a child `CancellationToken`; on timeout the token is
//!   cancelled before the future is dropped, so work the call spawned
//!   out-of-band observes the cancellation too
//! - Timeout errors are distinct from other errors

use std::future::Future;
use std::time::Duration;

use tokio::time::error::Elapsed;
use tokio_util::sync::CancellationToken;

/// Run `call` with a deadline, cancelling its token on timeout.
pub async fn run_with_deadline<F, Fut, T>(
    timeout: Duration,
    parent: &CancellationToken,
    call: F,
) -> Result<T, Elapsed>
where
    F: FnOnce(CancellationToken) -> Fut,
    Fut: Future<Output = T>,
{
    let token = parent.child_token();
    let call = call(token.clone());
    tokio::pin!(call);
    let result = tokio::time::timeout(timeout, &mut call).await;
    if result.is_err() {
        token.cancel();
    }
    result
}

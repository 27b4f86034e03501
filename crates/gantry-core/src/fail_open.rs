//! Fail-open helpers for auxiliary operations
//!
//! Activity logs and similar side channels must never stop a workflow. Wrap
//! them here so failures are logged and swallowed. Do not use this for state
//! persistence or worker invocation; those errors must reach the caller.

use std::future::Future;
use tracing::warn;

use crate::Result;

/// Run an auxiliary async operation, logging and discarding any error
pub async fn fail_open<F, Fut, T>(operation_name: &str, f: F) -> Option<T>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    match f().await {
        Ok(val) => Some(val),
        Err(e) => {
            warn!("{} failed (fail-open): {}", operation_name, e);
            None
        }
    }
}

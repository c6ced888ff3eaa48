//! Optimistic-concurrency retry for read-modify-write cycles.
//!
//! Objects shared between many reconciles (the ClusterRoleBinding subject
//! list) are updated with the resourceVersion that was read. If another
//! writer got in between, the API server answers 409 Conflict and the whole
//! cycle is re-run against a fresh read.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

use crate::error::Result;

/// Bound on conflict retries for one read-modify-write cycle.
#[derive(Clone, Copy, Debug)]
pub struct RetryPolicy {
    /// Total attempts, including the first one.
    pub attempts: u32,
    /// Sleep before retry `n` is `backoff * n`.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            backoff: Duration::from_millis(50),
        }
    }
}

/// Run `op` until it returns something other than [`Error::Conflict`] or the
/// attempt budget is spent. The last conflict is returned once exhausted.
///
/// [`Error::Conflict`]: crate::error::Error::Conflict
pub async fn retry_on_conflict<T, F, Fut>(policy: RetryPolicy, what: &str, mut op: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let attempts = policy.attempts.max(1);
    let mut attempt = 1;
    loop {
        match op().await {
            Err(e) if e.is_conflict() && attempt < attempts => {
                debug!(%what, attempt, "write conflict, retrying with a fresh read");
                tokio::time::sleep(policy.backoff * attempt).await;
                attempt += 1;
            }
            other => return other,
        }
    }
}

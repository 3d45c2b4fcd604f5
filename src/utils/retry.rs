//! Phase-scoped retry for transient collaborator failures.
//!
//! The retry counter is owned by the caller so it can be persisted (development
//! cycles count retries cumulatively across resumes).

use std::future::{self, Future};
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::OpsResult;
use crate::utils::CancellationToken;

/// Bound and linear backoff for one phase.
#[derive(Debug, Clone, Copy)]
pub struct PhaseRetry {
    pub max_retries: u32,
    pub backoff: Duration,
}

impl PhaseRetry {
    pub fn new(max_retries: u32, backoff: Duration) -> Self {
        Self { max_retries, backoff }
    }

    /// Run `f`, retrying transient errors while `*used < max_retries`.
    ///
    /// Non-transient errors and cancellation propagate immediately. Once the
    /// budget is spent the last transient error is returned.
    pub async fn run<T, F, Fut>(&self, label: &str, used: &mut u32, token: &CancellationToken, f: F) -> OpsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpsResult<T>>,
    {
        self.run_recorded(label, used, token, f, |_| future::ready(Ok(()))).await
    }

    /// [`run`](Self::run), calling `record` with the new count after every
    /// increment and before the backoff, so the spent budget survives a crash.
    pub async fn run_recorded<T, F, Fut, R, RFut>(
        &self,
        label: &str,
        used: &mut u32,
        token: &CancellationToken,
        mut f: F,
        mut record: R,
    ) -> OpsResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = OpsResult<T>>,
        R: FnMut(u32) -> RFut,
        RFut: Future<Output = OpsResult<()>>,
    {
        loop {
            token.check()?;
            match f().await {
                Ok(value) => {
                    if *used > 0 {
                        debug!(phase = label, retries = *used, "phase succeeded after retries");
                    }
                    return Ok(value);
                }
                Err(e) if e.is_transient() && *used < self.max_retries => {
                    *used += 1;
                    warn!(phase = label, retry = *used, max = self.max_retries, error = %e, "transient failure, retrying");
                    record(*used).await?;
                    token.sleep(self.backoff * *used).await?;
                }
                Err(e) => {
                    if e.is_transient() {
                        warn!(phase = label, retries = *used, error = %e, "retry budget exhausted");
                    }
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::OpsError;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[tokio::test(start_paused = true)]
    async fn test_retries_transient_until_success() {
        let calls = AtomicU32::new(0);
        let mut used = 0;
        let policy = PhaseRetry::new(3, Duration::from_secs(1));
        let token = CancellationToken::new();

        let value = policy
            .run("observing", &mut used, &token, || {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 2 {
                        Err(OpsError::transient("metrics", "unreachable"))
                    } else {
                        Ok(42)
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(value, 42);
        assert_eq!(used, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_is_cumulative() {
        let mut used = 3;
        let policy = PhaseRetry::new(3, Duration::from_secs(1));
        let token = CancellationToken::new();
        let res: OpsResult<()> = policy
            .run("building", &mut used, &token, || async { Err(OpsError::transient("builder", "hiccup")) })
            .await;
        assert!(res.unwrap_err().is_transient());
        assert_eq!(used, 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_increment_is_recorded() {
        let recorded = std::sync::Mutex::new(Vec::new());
        let mut used = 1;
        let policy = PhaseRetry::new(3, Duration::from_secs(1));
        let token = CancellationToken::new();
        let res: OpsResult<()> = policy
            .run_recorded(
                "building",
                &mut used,
                &token,
                || async { Err(OpsError::transient("builder", "hiccup")) },
                |n| {
                    recorded.lock().unwrap().push(n);
                    future::ready(Ok(()))
                },
            )
            .await;
        assert!(res.is_err());
        assert_eq!(*recorded.lock().unwrap(), vec![2, 3]);
    }

    #[tokio::test]
    async fn test_validation_errors_are_not_retried() {
        let calls = AtomicU32::new(0);
        let mut used = 0;
        let policy = PhaseRetry::new(5, Duration::from_millis(1));
        let token = CancellationToken::new();
        let res: OpsResult<()> = policy
            .run("coding", &mut used, &token, || {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err(OpsError::Validation("bad json".into())) }
            })
            .await;
        assert!(matches!(res, Err(OpsError::Validation(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(used, 0);
    }
}

//! Timeout and cancellation for external calls.

use std::future::Future;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{HeddleError, Result};

/// Wraps every call to a collaborator with the run's timeout and
/// cancellation token.
///
/// An expired timeout becomes [`HeddleError::Timeout`] and a cancelled run
/// becomes [`HeddleError::Cancelled`]. Both are fatal to the run, never a
/// validation rejection.
#[derive(Debug, Clone)]
pub struct CallGuard {
    timeout: Option<Duration>,
    cancel: CancellationToken,
}

impl CallGuard {
    /// Creates a guard with an optional per-call timeout.
    pub fn new(timeout: Option<Duration>, cancel: CancellationToken) -> Self {
        Self { timeout, cancel }
    }

    /// Creates a guard with no timeout and a token nobody cancels.
    pub fn unbounded() -> Self {
        Self::new(None, CancellationToken::new())
    }

    /// Returns the per-call timeout.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns the cancellation token.
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns true if the run has been cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Runs `call` under the timeout, racing it against cancellation.
    ///
    /// # Errors
    ///
    /// Returns the call's own error, [`HeddleError::Timeout`], or
    /// [`HeddleError::Cancelled`].
    pub async fn call<T, F>(&self, operation: &str, call: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let timed = async {
            match self.timeout {
                Some(limit) => match tokio::time::timeout(limit, call).await {
                    Ok(result) => result,
                    Err(_) => Err(HeddleError::Timeout {
                        operation: operation.to_string(),
                        after: limit,
                    }),
                },
                None => call.await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(HeddleError::Cancelled),
            result = timed => result,
        }
    }
}

impl Default for CallGuard {
    fn default() -> Self {
        Self::unbounded()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_call_passes_through_result() {
        let guard = CallGuard::unbounded();
        let value = guard.call("op", async { Ok(7) }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test]
    async fn test_call_passes_through_error() {
        let guard = CallGuard::unbounded();
        let result: Result<()> = guard
            .call("op", async { Err(HeddleError::Generator("bad".to_string())) })
            .await;
        assert!(matches!(result, Err(HeddleError::Generator(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_times_out() {
        let guard = CallGuard::new(Some(Duration::from_millis(50)), CancellationToken::new());
        let result: Result<()> = guard
            .call("generator", async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            })
            .await;
        assert!(matches!(
            result,
            Err(HeddleError::Timeout { ref operation, .. }) if operation == "generator"
        ));
    }

    #[tokio::test]
    async fn test_call_observes_cancellation() {
        let token = CancellationToken::new();
        let guard = CallGuard::new(None, token.clone());
        token.cancel();

        let result: Result<()> = guard
            .call("stats provider", std::future::pending::<Result<()>>())
            .await;
        assert!(matches!(result, Err(HeddleError::Cancelled)));
        assert!(guard.is_cancelled());
    }
}

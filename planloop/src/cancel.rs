//! Cooperative cancellation at external-call boundaries.
//!
//! Cancellation is the one outcome that is never folded into result data:
//! every entry point returns `Err(Cancelled)` as soon as the token fires.

use std::future::Future;

use tokio_util::sync::CancellationToken;

/// The caller cancelled the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("operation cancelled")]
pub struct Cancelled;

/// True when `err` is (or wraps) a cancellation.
pub fn is_cancellation(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| cause.is::<Cancelled>())
}

/// Race `fut` against the token. The future is dropped on cancellation.
pub async fn guard<F: Future>(cancel: &CancellationToken, fut: F) -> Result<F::Output, Cancelled> {
    if cancel.is_cancelled() {
        return Err(Cancelled);
    }
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Cancelled),
        output = fut => Ok(output),
    }
}

/// Guard a fallible collaborator call, lifting collaborator-reported
/// cancellations out of the inner error.
pub async fn call<T, F>(cancel: &CancellationToken, fut: F) -> Result<anyhow::Result<T>, Cancelled>
where
    F: Future<Output = anyhow::Result<T>>,
{
    match guard(cancel, fut).await? {
        Err(err) if is_cancellation(&err) => Err(Cancelled),
        other => Ok(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::anyhow;
    use std::time::Duration;

    #[tokio::test]
    async fn guard_returns_output_when_not_cancelled() {
        let cancel = CancellationToken::new();
        assert_eq!(guard(&cancel, async { 7 }).await, Ok(7));
    }

    #[tokio::test]
    async fn guard_stops_pending_future_on_cancel() {
        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel();
        });
        let result = guard(&cancel, std::future::pending::<()>()).await;
        assert_eq!(result, Err(Cancelled));
    }

    #[tokio::test]
    async fn call_lifts_wrapped_cancellation() {
        let cancel = CancellationToken::new();
        let lifted = call(&cancel, async {
            Err::<(), _>(anyhow::Error::new(Cancelled).context("backend a"))
        })
        .await;
        assert!(lifted.is_err());

        let plain = call(&cancel, async { Err::<(), _>(anyhow!("boom")) }).await;
        assert!(matches!(plain, Ok(Err(_))));
    }
}

use anyhow::Result;
use std::future::Future;

/// Runs a best-effort coordination step. On failure it logs one line with
/// the step label and returns `None` instead of propagating, so a cleanup
/// sequence always attempts every remaining sub-step.
pub async fn safe_run<T, F>(label: &str, op: F) -> Option<T>
where
    F: Future<Output = Result<T>>,
{
    match op.await {
        Ok(value) => Some(value),
        Err(e) => {
            tracing::warn!("[error label={} err={:#}]", label, e);
            None
        }
    }
}

use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    Reached,
    TimedOut,
}

/// Call `probe` every `interval` until it returns `true` or `timeout` elapses.
/// The probe runs once before the first wait. Probe errors count as "not yet".
pub async fn poll_until<F, Fut>(interval: Duration, timeout: Duration, mut probe: F) -> PollOutcome
where
    F: FnMut() -> Fut,
    Fut: Future<Output = anyhow::Result<bool>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        match probe().await {
            Ok(true) => return PollOutcome::Reached,
            Ok(false) => {}
            Err(e) => tracing::debug!("poll probe failed: {e:#}"),
        }
        let now = Instant::now();
        if now >= deadline {
            return PollOutcome::TimedOut;
        }
        tokio::time::sleep(interval.min(deadline - now)).await;
    }
}

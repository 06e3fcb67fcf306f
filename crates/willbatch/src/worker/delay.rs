use std::time::Duration;

use async_trait::async_trait;

/// Source of the pause between two batches.
///
/// The processor races every pause against the job's cancellation token,
/// so implementations never need to watch for cancellation themselves.
#[async_trait]
pub trait BatchDelay: Send + Sync {
    async fn pause(&self, duration: Duration);
}

/// Real wall-clock delay on the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDelay;

#[async_trait]
impl BatchDelay for TokioDelay {
    async fn pause(&self, duration: Duration) {
        if !duration.is_zero() {
            tokio::time::sleep(duration).await;
        }
    }
}

/// Yields to the scheduler without waiting.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoDelay;

#[async_trait]
impl BatchDelay for NoDelay {
    async fn pause(&self, _duration: Duration) {
        tokio::task::yield_now().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_tokio_delay_waits_on_timer() {
        let start = tokio::time::Instant::now();
        TokioDelay.pause(Duration::from_millis(500)).await;
        assert!(start.elapsed() >= Duration::from_millis(500));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_delay_returns_immediately() {
        let start = tokio::time::Instant::now();
        NoDelay.pause(Duration::from_secs(60)).await;
        assert!(start.elapsed() < Duration::from_secs(1));
    }
}

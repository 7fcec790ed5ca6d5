use async_trait::async_trait;
use std::time::Duration;
use tracing::debug;

pub const DEFAULT_SYNC_DELAY: Duration = Duration::from_millis(100);

/// Pacing between sequential upstream detail calls.
#[async_trait]
pub trait Throttle: Send + Sync {
    async fn pause(&self);
}

#[derive(Debug, Clone, Copy)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }
}

impl Default for FixedDelay {
    fn default() -> Self {
        Self::new(DEFAULT_SYNC_DELAY)
    }
}

#[async_trait]
impl Throttle for FixedDelay {
    async fn pause(&self) {
        if self.delay.is_zero() {
            return;
        }
        debug!(event = "sync_throttle", delay_ms = self.delay.as_millis() as u64);
        tokio::time::sleep(self.delay).await;
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoThrottle;

#[async_trait]
impl Throttle for NoThrottle {
    async fn pause(&self) {}
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn fixed_delay_sleeps_for_configured_duration() {
        let throttle = FixedDelay::default();
        let started = tokio::time::Instant::now();
        throttle.pause().await;
        assert!(started.elapsed() >= DEFAULT_SYNC_DELAY);
    }

    #[tokio::test(start_paused = true)]
    async fn zero_delay_does_not_sleep() {
        let throttle = FixedDelay::new(Duration::ZERO);
        let started = tokio::time::Instant::now();
        throttle.pause().await;
        assert_eq!(started.elapsed(), Duration::ZERO);
    }
}

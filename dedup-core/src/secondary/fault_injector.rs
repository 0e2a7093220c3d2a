use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Controller for injecting failures into the in-memory secondary store, so the witness and the
/// recovery path can be exercised against an unavailable or slow secondary.
#[derive(Debug, Default)]
pub struct FaultInjector {
    /// While set, every operation fails.
    outage: AtomicBool,
    /// Fail the next N put operations.
    fail_next_puts: AtomicUsize,
    /// Fail the next N exists operations.
    fail_next_exists: AtomicUsize,
    /// Artificial put latency in milliseconds.
    put_latency_ms: AtomicU64,
    /// Artificial exists latency in milliseconds.
    exists_latency_ms: AtomicU64,
}

impl FaultInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulates total unavailability of the store until reset.
    pub fn set_outage(&self, down: bool) {
        self.outage.store(down, Ordering::SeqCst);
    }

    pub fn fail_puts(&self, count: usize) {
        self.fail_next_puts.store(count, Ordering::Relaxed);
    }

    pub fn fail_exists(&self, count: usize) {
        self.fail_next_exists.store(count, Ordering::Relaxed);
    }

    pub fn set_put_latency(&self, latency: Duration) {
        self.put_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn set_exists_latency(&self, latency: Duration) {
        self.exists_latency_ms
            .store(latency.as_millis() as u64, Ordering::Relaxed);
    }

    pub(crate) fn is_down(&self) -> bool {
        self.outage.load(Ordering::SeqCst)
    }

    pub(crate) fn should_fail_put(&self) -> bool {
        self.is_down() || Self::decrement_counter(&self.fail_next_puts)
    }

    pub(crate) fn should_fail_exists(&self) -> bool {
        self.is_down() || Self::decrement_counter(&self.fail_next_exists)
    }

    pub(crate) async fn apply_put_latency(&self) {
        Self::apply_latency(&self.put_latency_ms).await;
    }

    pub(crate) async fn apply_exists_latency(&self) {
        Self::apply_latency(&self.exists_latency_ms).await;
    }

    /// Decrements the counter and returns true if it was > 0.
    fn decrement_counter(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |c| {
                if c > 0 { Some(c - 1) } else { None }
            })
            .is_ok()
    }

    async fn apply_latency(latency_ms: &AtomicU64) {
        let ms = latency_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_failure_countdowns() {
        let injector = FaultInjector::new();
        assert!(!injector.should_fail_put());

        injector.fail_puts(2);
        assert!(injector.should_fail_put());
        assert!(injector.should_fail_put());
        assert!(!injector.should_fail_put());

        injector.fail_exists(1);
        assert!(injector.should_fail_exists());
        assert!(!injector.should_fail_exists());
    }

    #[test]
    fn test_outage_fails_everything_until_reset() {
        let injector = FaultInjector::new();
        injector.set_outage(true);
        for _ in 0..10 {
            assert!(injector.should_fail_put());
            assert!(injector.should_fail_exists());
        }
        injector.set_outage(false);
        assert!(!injector.should_fail_put());
    }

    #[tokio::test]
    async fn test_latency() {
        let injector = FaultInjector::new();
        injector.set_put_latency(Duration::from_millis(30));
        let start = std::time::Instant::now();
        injector.apply_put_latency().await;
        assert!(start.elapsed() >= Duration::from_millis(30));

        let start = std::time::Instant::now();
        injector.apply_exists_latency().await;
        assert!(start.elapsed() < Duration::from_millis(30));
    }
}

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::{sleep, sleep_until, Instant};

/// Enforces a minimum interval between two requests to the same domain.
///
/// Each domain owns an async slot: waiters on one domain queue behind each
/// other while other domains proceed independently.
#[derive(Debug, Clone)]
pub struct DomainLimiter {
    min_interval: Duration,
    slots: Arc<Mutex<HashMap<String, Arc<tokio::sync::Mutex<Option<Instant>>>>>>,
}

impl DomainLimiter {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            slots: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Returns once `min_interval` has elapsed since the previous request to
    /// `domain`, recording the new request time before returning.
    pub async fn wait(&self, domain: &str) {
        if self.min_interval.is_zero() {
            return;
        }

        let slot = {
            let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
            slots
                .entry(domain.to_ascii_lowercase())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(None)))
                .clone()
        };

        let mut last = slot.lock().await;
        if let Some(prev) = *last {
            match prev.checked_add(self.min_interval) {
                Some(at) => sleep_until(at).await,
                None => sleep(self.min_interval).await,
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use futures::future::join_all;

    #[tokio::test(start_paused = true)]
    async fn same_domain_is_spaced() {
        let limiter = DomainLimiter::new(Duration::from_secs(2));

        let start = Instant::now();
        limiter.wait("schools.example.org").await;
        let first = Instant::now();
        limiter.wait("SCHOOLS.example.org").await;
        let second = Instant::now();

        assert_eq!(first, start);
        assert!(second - first >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn other_domains_do_not_wait() {
        let limiter = DomainLimiter::new(Duration::from_secs(5));

        let start = Instant::now();
        limiter.wait("a.example.org").await;
        limiter.wait("b.example.org").await;
        limiter.wait("c.example.org").await;

        assert_eq!(Instant::now(), start);
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_waiters_are_serialized() {
        let limiter = DomainLimiter::new(Duration::from_millis(500));
        let times = Arc::new(Mutex::new(Vec::new()));

        join_all((0..4).map(|_| {
            let limiter = limiter.clone();
            let times = times.clone();
            async move {
                limiter.wait("district.example.org").await;
                times.lock().unwrap().push(Instant::now());
            }
        }))
        .await;

        let mut times = times.lock().unwrap().clone();
        times.sort();
        assert_eq!(times.len(), 4);
        for pair in times.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn saturated_interval_does_not_overflow() {
        let limiter = DomainLimiter::new(Duration::MAX);

        limiter.wait("example.org").await;
        let second = tokio::time::timeout(Duration::from_secs(3600), limiter.wait("example.org")).await;

        assert!(second.is_err());
    }

    #[tokio::test]
    async fn zero_interval_disables_throttling() {
        let limiter = DomainLimiter::new(Duration::ZERO);
        for _ in 0..100 {
            limiter.wait("example.org").await;
        }
        assert!(limiter.slots.lock().unwrap().is_empty());
    }
}

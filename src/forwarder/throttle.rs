use std::time::{Duration, Instant};

/// Per-substream token bucket (spec.md §4.5.5 "Throttle transform").
/// `kbps == 0` disables pacing entirely: `admit` always returns immediately
/// with no delay, but callers still account the bytes via `Metrics`.
pub struct TokenBucket {
    capacity: f64,
    rate_per_sec: f64,
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(kbps: u64) -> Self {
        let rate_per_sec = (kbps * 1024) as f64;
        Self {
            capacity: rate_per_sec,
            rate_per_sec,
            tokens: rate_per_sec,
            last_refill: Instant::now(),
        }
    }

    pub fn is_unthrottled(&self) -> bool {
        self.rate_per_sec <= 0.0
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.rate_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Blocks until `n` bytes may be admitted, then debits the bucket.
    pub async fn admit(&mut self, n: usize) {
        if self.is_unthrottled() {
            return;
        }
        loop {
            self.refill();
            if self.tokens >= n as f64 {
                self.tokens -= n as f64;
                return;
            }
            let deficit = n as f64 - self.tokens;
            let delay_ms = (deficit / self.rate_per_sec * 1000.0).ceil().max(1.0);
            tokio::time::sleep(Duration::from_millis(delay_ms as u64)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn unthrottled_bucket_never_delays() {
        let mut bucket = TokenBucket::new(0);
        assert!(bucket.is_unthrottled());
        bucket.admit(1_000_000).await;
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_bucket_paces_large_chunks() {
        let mut bucket = TokenBucket::new(1); // 1024 bytes/sec, capacity 1024
        bucket.admit(1024).await; // drains the initial full bucket instantly

        let admit = tokio::spawn(async move {
            bucket.admit(1024).await;
            bucket
        });
        tokio::time::sleep(Duration::from_millis(1100)).await;
        admit.await.expect("admit task");
    }
}

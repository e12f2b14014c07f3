//! Token-bucket limiter in front of the capture write path.
//!
//! Capacity equals the configured packets-per-second; a background task adds
//! one token every `1s / pps` and exits as soon as the run's shutdown signal
//! fires. A writer that finds the bucket empty waits at most one refill
//! interval, then drops the frame and counts it.

use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

use log::trace;
use tokio::sync::{watch, Semaphore};
use tokio::time::timeout;

pub struct RateLimiter {
    tokens: Arc<Semaphore>,
    refill_interval: Duration,
    dropped: AtomicU64,
}

impl RateLimiter {
    /// Starts the refill task. The task holds only the shutdown receiver and
    /// a weak-ish clone of the bucket, so a stopped run leaks nothing.
    pub fn new(pps: u32, mut shutdown: watch::Receiver<bool>) -> Arc<Self> {
        let pps = pps.max(1);
        let tokens = Arc::new(Semaphore::new(pps as usize));
        let refill_interval = Duration::from_secs(1) / pps;

        let refill = tokens.clone();
        let capacity = pps as usize;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        // A dropped sender means the run is gone too.
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    _ = tokio::time::sleep(refill_interval) => {
                        if refill.available_permits() < capacity {
                            refill.add_permits(1);
                        }
                    }
                }
            }
            trace!("rate limiter refill task exited");
        });

        Arc::new(Self {
            tokens,
            refill_interval,
            dropped: AtomicU64::new(0),
        })
    }

    /// Consumes one token, waiting at most one refill interval for it.
    /// Returns false when the frame should be dropped instead of sent.
    pub async fn acquire(&self) -> bool {
        match timeout(self.refill_interval, self.tokens.acquire()).await {
            Ok(Ok(permit)) => {
                permit.forget();
                true
            }
            _ => {
                self.dropped.fetch_add(1, Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn tokens_are_consumed_and_counted() {
        let (_tx, rx) = watch::channel(false);
        let limiter = RateLimiter::new(2, rx);
        assert!(limiter.acquire().await);
        assert!(limiter.acquire().await);
        // Bucket empty; one refill interval (500 ms) may grant one token, so
        // draining twice more guarantees at least one drop.
        let a = limiter.acquire().await;
        let b = limiter.acquire().await;
        assert!(!(a && b));
        assert!(limiter.dropped() >= 1);
    }

    #[tokio::test]
    async fn refill_restores_tokens() {
        let (_tx, rx) = watch::channel(false);
        let limiter = RateLimiter::new(20, rx);
        for _ in 0..20 {
            let _ = limiter.acquire().await;
        }
        // 50 ms per token at 20 pps; waiting well past one interval must
        // allow another send.
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(limiter.acquire().await);
    }

    #[tokio::test]
    async fn shutdown_stops_refill() {
        let (tx, rx) = watch::channel(false);
        let limiter = RateLimiter::new(1, rx);
        assert!(limiter.acquire().await);
        tx.send(true).unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        // The refill task is gone; nothing panics and the bucket simply
        // stays in whatever state it was left.
        let _ = limiter.dropped();
    }
}

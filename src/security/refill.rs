//! Background token refill.
//!
//! Refills every bucket on a fixed interval, independent of traffic, so quota
//! recovery is visible for keys that see no requests.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{self, MissedTickBehavior};

use crate::security::rate_limit::RateLimiter;

pub struct TokenRefill {
    limiter: Arc<RateLimiter>,
    interval: Duration,
}

impl TokenRefill {
    pub fn new(limiter: Arc<RateLimiter>, interval: Duration) -> Self {
        Self { limiter, interval }
    }

    /// Spawn the loop. Await the handle to block until it has exited.
    pub fn spawn(self, shutdown: broadcast::Receiver<()>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    pub async fn run(self, mut shutdown: broadcast::Receiver<()>) {
        tracing::info!(interval = ?self.interval, "Token refill starting");

        let mut ticker = time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.limiter.refill_all();
                }
                _ = shutdown.recv() => {
                    tracing::info!("Token refill received shutdown signal, exiting loop");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::rate_limit::GLOBAL_KEY;
    use crate::security::token_bucket::Limit;

    #[tokio::test]
    async fn refills_without_traffic_and_stops_on_shutdown() {
        let limiter = Arc::new(RateLimiter::new());
        limiter.set_limit(
            GLOBAL_KEY,
            Limit::new(1, Duration::from_millis(100)).unwrap(),
        );
        assert!(limiter.allow("x"));
        assert_eq!(limiter.tokens(GLOBAL_KEY), Some(0));

        let (tx, rx) = broadcast::channel(1);
        let handle = TokenRefill::new(limiter.clone(), Duration::from_millis(150)).spawn(rx);

        // First tick fires immediately, the second after ~150ms.
        time::sleep(Duration::from_millis(400)).await;
        assert_eq!(limiter.tokens(GLOBAL_KEY), Some(1));

        tx.send(()).unwrap();
        time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("refill loop did not exit")
            .unwrap();
    }
}

//! Background warm-keeping for pinned stops.
//!
//! One pass walks every pinned stop sequentially with a fixed delay
//! between requests — deliberate backpressure against the upstream rate
//! limit. A stop's failure never aborts the pass.

use std::time::Duration;

use common::config::RefresherConfig;
use common::{PinnedStop, PredictionQuery};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::cache::{CacheReadOptions, PredictionCache};

pub struct BackgroundRefresher {
    cache: PredictionCache,
    stops: Vec<PinnedStop>,
    result_limit: u32,
    poll_interval: Duration,
    stop_delay: Duration,
}

impl BackgroundRefresher {
    pub fn new(
        cache: PredictionCache,
        stops: Vec<PinnedStop>,
        cfg: &RefresherConfig,
        result_limit: u32,
    ) -> Self {
        Self {
            cache,
            stops,
            result_limit,
            poll_interval: Duration::from_secs(cfg.poll_interval_secs),
            stop_delay: Duration::from_millis(cfg.stop_delay_ms),
        }
    }

    fn query_for(&self, stop: &PinnedStop) -> PredictionQuery {
        PredictionQuery {
            stop_id: stop.stop_id.clone(),
            route_type: stop.route_type,
            route_id: stop.route_id.clone(),
            limit: self.result_limit,
        }
    }

    /// Self-rescheduling refresh cycle: each pass takes as long as it
    /// takes, then the next starts `poll_interval` after the previous
    /// began (never sooner than immediately).
    pub async fn run(self) {
        info!(
            "Background refresher keeping {} stop(s) warm every {}s",
            self.stops.len(),
            self.poll_interval.as_secs()
        );

        loop {
            let started = Instant::now();
            self.run_pass().await;
            let elapsed = started.elapsed();
            sleep(self.poll_interval.saturating_sub(elapsed)).await;
        }
    }

    /// One sequential pass over the pinned stops.
    pub async fn run_pass(&self) {
        let force = CacheReadOptions {
            force_refresh: true,
            allow_stale: true,
        };

        for (i, stop) in self.stops.iter().enumerate() {
            if i > 0 {
                sleep(self.stop_delay).await;
            }

            match self.cache.get(&self.query_for(stop), force).await {
                Ok(hit) => {
                    debug!(
                        "Refreshed {}: {} predictions ({})",
                        stop.stop_id,
                        hit.payload.predictions.len(),
                        hit.provenance.as_str()
                    );
                }
                Err(e) => {
                    warn!("Refresh failed for {}: {}", stop.stop_id, e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::config::CacheConfig;
    use common::{Error, PredictionPayload, Provenance, Result};
    use futures_util::future::BoxFuture;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct FlakySource {
        calls: AtomicUsize,
    }

    impl crate::cache::PredictionSource for FlakySource {
        fn fetch<'a>(
            &'a self,
            query: &'a PredictionQuery,
        ) -> BoxFuture<'a, Result<PredictionPayload>> {
            Box::pin(async move {
                self.calls.fetch_add(1, Ordering::SeqCst);
                if query.stop_id == "stop-bad" {
                    Err(Error::Http("connection refused".into()))
                } else {
                    Ok(PredictionPayload {
                        stop_id: query.stop_id.clone(),
                        fetched_at: chrono::Utc::now(),
                        predictions: Vec::new(),
                    })
                }
            })
        }
    }

    fn pinned(stop_id: &str) -> PinnedStop {
        PinnedStop {
            stop_id: stop_id.into(),
            name: stop_id.into(),
            route_type: Some(1),
            route_id: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn failing_stop_does_not_abort_the_pass() {
        let source = Arc::new(FlakySource {
            calls: AtomicUsize::new(0),
        });
        let cache = PredictionCache::new(source.clone(), &CacheConfig::default(), None);
        let refresher = BackgroundRefresher::new(
            cache.clone(),
            vec![pinned("stop-bad"), pinned("stop-good")],
            &RefresherConfig::default(),
            16,
        );

        refresher.run_pass().await;

        assert_eq!(source.calls.load(Ordering::SeqCst), 2);

        // The good stop is now warm and served from cache.
        let hit = cache
            .get(
                &refresher.query_for(&pinned("stop-good")),
                CacheReadOptions::default(),
            )
            .await
            .unwrap();
        assert_eq!(hit.provenance, Provenance::FreshCache);
    }
}

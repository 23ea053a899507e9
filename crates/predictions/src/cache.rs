//! Per-key prediction cache shielding the rate-limited upstream.
//!
//! Entries move through fresh → stale → expired as they age. Concurrent
//! readers of the same key share one upstream fetch, and a failed refetch
//! falls back to the previous payload while it is within the staleness
//! tolerance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use common::config::CacheConfig;
use common::{CacheKey, Error, PredictionPayload, PredictionQuery, Provenance, Result};
use futures_util::future::BoxFuture;
use serde_json::json;
use tokio::sync::{broadcast, Mutex};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::journal::{now_iso, FetchJournal};

/// The upstream predictions source. The cache never knows the concrete
/// transport behind it.
pub trait PredictionSource: Send + Sync + 'static {
    fn fetch<'a>(&'a self, query: &'a PredictionQuery) -> BoxFuture<'a, Result<PredictionPayload>>;
}

impl PredictionSource for mbta_client::MbtaClient {
    fn fetch<'a>(&'a self, query: &'a PredictionQuery) -> BoxFuture<'a, Result<PredictionPayload>> {
        Box::pin(self.fetch_stop_predictions(query))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct CacheReadOptions {
    /// Always attempt a fetch, still sharing any outstanding one.
    pub force_refresh: bool,
    /// Permit serving a payload past its fresh TTL (and the failed-refetch
    /// fallback). When false, only fresh data or a successful fetch count.
    pub allow_stale: bool,
}

impl Default for CacheReadOptions {
    fn default() -> Self {
        Self {
            force_refresh: false,
            allow_stale: true,
        }
    }
}

/// A successful cache read: the payload plus where it came from.
#[derive(Debug, Clone)]
pub struct CacheHit {
    pub payload: Arc<PredictionPayload>,
    pub provenance: Provenance,
    /// The upstream failure behind a stale serve, when there was one.
    pub upstream_error: Option<String>,
}

type FetchOutcome = std::result::Result<Arc<PredictionPayload>, Arc<Error>>;

#[derive(Debug)]
struct FetchFailure {
    message: String,
    at: DateTime<Utc>,
}

#[derive(Default)]
struct CacheEntry {
    payload: Option<Arc<PredictionPayload>>,
    fetched_at: Option<Instant>,
    expires_at: Option<Instant>,
    last_error: Option<FetchFailure>,
    in_flight: Option<broadcast::Sender<FetchOutcome>>,
}

impl CacheEntry {
    fn is_fresh(&self, now: Instant) -> bool {
        self.payload.is_some() && matches!(self.expires_at, Some(at) if now < at)
    }

    fn within_stale(&self, now: Instant, stale_ttl: Duration) -> bool {
        self.payload.is_some() && matches!(self.fetched_at, Some(at) if now < at + stale_ttl)
    }

    fn last_error_message(&self) -> Option<String> {
        self.last_error.as_ref().map(|e| e.message.clone())
    }
}

/// Clone an error shared between concurrent awaiters, preserving the
/// variants the read endpoints map to status codes.
fn shared_error(err: &Error) -> Error {
    match err {
        Error::MbtaApi { status, message } => Error::MbtaApi {
            status: *status,
            message: message.clone(),
        },
        Error::Timeout(secs) => Error::Timeout(*secs),
        Error::Http(msg) => Error::Http(msg.clone()),
        Error::NoData(msg) => Error::NoData(msg.clone()),
        other => Error::Other(other.to_string()),
    }
}

struct CacheInner {
    source: Arc<dyn PredictionSource>,
    entries: Mutex<HashMap<CacheKey, CacheEntry>>,
    journal: Option<Arc<std::sync::Mutex<FetchJournal>>>,
    fresh_ttl: Duration,
    stale_ttl: Duration,
    fetch_timeout: Duration,
}

#[derive(Clone)]
pub struct PredictionCache {
    inner: Arc<CacheInner>,
}

enum Plan {
    Return(CacheHit),
    Await(broadcast::Receiver<FetchOutcome>),
}

impl PredictionCache {
    /// `journal` is the audit sink successful fetches are reported to;
    /// pass None to skip auditing (tests, one-shot runs).
    pub fn new(
        source: Arc<dyn PredictionSource>,
        cfg: &CacheConfig,
        journal: Option<Arc<std::sync::Mutex<FetchJournal>>>,
    ) -> Self {
        Self {
            inner: Arc::new(CacheInner {
                source,
                entries: Mutex::new(HashMap::new()),
                journal,
                fresh_ttl: Duration::from_secs(cfg.fresh_ttl_secs),
                stale_ttl: Duration::from_secs(cfg.stale_ttl_secs),
                fetch_timeout: Duration::from_secs(cfg.fetch_timeout_secs),
            }),
        }
    }

    /// Read predictions for a query, fetching upstream only when the cache
    /// cannot answer. See `CacheReadOptions` for the two knobs.
    pub async fn get(&self, query: &PredictionQuery, opts: CacheReadOptions) -> Result<CacheHit> {
        let key = query.cache_key();

        let plan = {
            let mut entries = self.inner.entries.lock().await;
            let entry = entries.entry(key.clone()).or_default();
            let now = Instant::now();

            let mut served: Option<Plan> = None;
            if !opts.force_refresh {
                if entry.is_fresh(now) {
                    served = Some(Plan::Return(CacheHit {
                        payload: entry.payload.clone().unwrap(),
                        provenance: Provenance::FreshCache,
                        upstream_error: None,
                    }));
                } else if opts.allow_stale && entry.within_stale(now, self.inner.stale_ttl) {
                    if let Some(failure) = &entry.last_error {
                        debug!(
                            "serving stale payload for {}: last failure at {}: {}",
                            key.stop_id, failure.at, failure.message
                        );
                    }
                    served = Some(Plan::Return(CacheHit {
                        payload: entry.payload.clone().unwrap(),
                        provenance: Provenance::StaleCache,
                        upstream_error: entry.last_error_message(),
                    }));
                }
            }

            match served {
                Some(plan) => plan,
                // A fetch is needed. Join the outstanding one if any,
                // otherwise start one and subscribe to its outcome.
                None => {
                    if let Some(sender) = &entry.in_flight {
                        Plan::Await(sender.subscribe())
                    } else {
                        let (tx, rx) = broadcast::channel(1);
                        entry.in_flight = Some(tx);
                        tokio::spawn(CacheInner::run_fetch(
                            self.inner.clone(),
                            query.clone(),
                            key.clone(),
                        ));
                        Plan::Await(rx)
                    }
                }
            }
        };

        match plan {
            Plan::Return(hit) => Ok(hit),
            Plan::Await(mut rx) => match rx.recv().await {
                Ok(Ok(payload)) => Ok(CacheHit {
                    payload,
                    provenance: Provenance::FreshFetch,
                    upstream_error: None,
                }),
                Ok(Err(err)) => self.stale_fallback(&key, opts, &err).await,
                Err(_) => Err(Error::Other("prediction fetch task aborted".into())),
            },
        }
    }

    /// After a failed fetch: serve the previous payload if it is still
    /// within the staleness tolerance, otherwise surface the failure.
    async fn stale_fallback(
        &self,
        key: &CacheKey,
        opts: CacheReadOptions,
        err: &Error,
    ) -> Result<CacheHit> {
        if opts.allow_stale {
            let entries = self.inner.entries.lock().await;
            if let Some(entry) = entries.get(key) {
                if entry.within_stale(Instant::now(), self.inner.stale_ttl) {
                    let payload = entry.payload.clone().unwrap();
                    return Ok(CacheHit {
                        payload,
                        provenance: Provenance::StaleAfterFailedRefetch,
                        upstream_error: Some(err.to_string()),
                    });
                }
            }
        }
        Err(shared_error(err))
    }
}

impl CacheInner {
    /// Run one upstream fetch for `key` and publish the outcome to every
    /// subscriber. Detached from the initiating caller so a dropped reader
    /// never strands the others.
    async fn run_fetch(inner: Arc<CacheInner>, query: PredictionQuery, key: CacheKey) {
        let outcome: FetchOutcome =
            match tokio::time::timeout(inner.fetch_timeout, inner.source.fetch(&query)).await {
                Ok(Ok(payload)) => Ok(Arc::new(payload)),
                Ok(Err(err)) => Err(Arc::new(err)),
                Err(_) => Err(Arc::new(Error::Timeout(inner.fetch_timeout.as_secs()))),
            };

        let sender = {
            let mut entries = inner.entries.lock().await;
            let entry = entries.entry(key.clone()).or_default();
            match &outcome {
                Ok(payload) => {
                    let now = Instant::now();
                    entry.payload = Some(payload.clone());
                    entry.fetched_at = Some(now);
                    entry.expires_at = Some(now + inner.fresh_ttl);
                    entry.last_error = None;
                }
                Err(err) => {
                    debug!("fetch failed for {}: {}", key.stop_id, err);
                    entry.last_error = Some(FetchFailure {
                        message: err.to_string(),
                        at: Utc::now(),
                    });
                }
            }
            entry.in_flight.take()
        };

        if let Ok(payload) = &outcome {
            inner.audit(&query, payload);
        }

        if let Some(tx) = sender {
            // No receivers left is fine — the entry is already updated.
            let _ = tx.send(outcome);
        }
    }

    fn audit(&self, query: &PredictionQuery, payload: &Arc<PredictionPayload>) {
        let Some(journal) = &self.journal else {
            return;
        };
        let event = json!({
            "ts": now_iso(),
            "kind": "fetch_ok",
            "stop_id": query.stop_id,
            "route_type": query.route_type,
            "route_id": query.route_id,
            "count": payload.predictions.len(),
        });
        match journal.lock() {
            Ok(mut journal) => journal.write_event(event),
            Err(e) => warn!("fetch journal unavailable: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::Prediction;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn make_payload(stop_id: &str, count: usize) -> PredictionPayload {
        let predictions = (0..count)
            .map(|i| Prediction {
                id: format!("p-{}", i),
                direction_id: Some(0),
                direction: "Outbound".into(),
                status: None,
                arrival_time: None,
                departure_time: None,
                minutes: Some(i as i64),
                route_id: Some("Blue".into()),
                route_name: Some("Blue Line".into()),
                headsign: None,
            })
            .collect();
        PredictionPayload {
            stop_id: stop_id.into(),
            fetched_at: Utc::now(),
            predictions,
        }
    }

    fn make_query(stop_id: &str) -> PredictionQuery {
        PredictionQuery {
            stop_id: stop_id.into(),
            route_type: Some(1),
            route_id: None,
            limit: 16,
        }
    }

    struct MockSource {
        calls: AtomicUsize,
        delay: Duration,
        outcomes: std::sync::Mutex<VecDeque<Result<PredictionPayload>>>,
    }

    impl MockSource {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                delay,
                outcomes: std::sync::Mutex::new(VecDeque::new()),
            }
        }

        fn push(&self, outcome: Result<PredictionPayload>) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl PredictionSource for MockSource {
        fn fetch<'a>(
            &'a self,
            query: &'a PredictionQuery,
        ) -> BoxFuture<'a, Result<PredictionPayload>> {
            Box::pin(async move {
                tokio::time::sleep(self.delay).await;
                self.calls.fetch_add(1, Ordering::SeqCst);
                match self.outcomes.lock().unwrap().pop_front() {
                    Some(outcome) => outcome,
                    None => Ok(make_payload(&query.stop_id, 1)),
                }
            })
        }
    }

    fn cache_config() -> CacheConfig {
        CacheConfig {
            fresh_ttl_secs: 10,
            stale_ttl_secs: 60,
            fetch_timeout_secs: 8,
            result_limit: 16,
        }
    }

    fn make_cache(source: Arc<MockSource>) -> PredictionCache {
        PredictionCache::new(source, &cache_config(), None)
    }

    #[tokio::test(start_paused = true)]
    async fn concurrent_reads_share_one_fetch() {
        let source = Arc::new(MockSource::new(Duration::from_millis(100)));
        source.push(Ok(make_payload("stop-a", 3)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");

        let mut handles = Vec::new();
        for _ in 0..5 {
            let cache = cache.clone();
            let query = query.clone();
            handles.push(tokio::spawn(async move {
                cache.get(&query, CacheReadOptions::default()).await
            }));
        }

        let mut payloads = Vec::new();
        for handle in handles {
            let hit = handle.await.unwrap().unwrap();
            assert_eq!(hit.provenance, Provenance::FreshFetch);
            payloads.push(hit.payload);
        }

        assert_eq!(source.calls(), 1);
        for pair in payloads.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn fresh_entry_served_without_upstream_call() {
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");

        let first = cache.get(&query, CacheReadOptions::default()).await.unwrap();
        assert_eq!(first.provenance, Provenance::FreshFetch);

        let second = cache.get(&query, CacheReadOptions::default()).await.unwrap();
        assert_eq!(second.provenance, Provenance::FreshCache);
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn successful_refresh_advances_expiry_and_failure_does_not() {
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");
        let key = query.cache_key();

        cache.get(&query, CacheReadOptions::default()).await.unwrap();
        let first_expiry = {
            let entries = cache.inner.entries.lock().await;
            entries.get(&key).unwrap().expires_at.unwrap()
        };

        tokio::time::advance(Duration::from_secs(2)).await;

        let force = CacheReadOptions {
            force_refresh: true,
            allow_stale: true,
        };
        cache.get(&query, force).await.unwrap();
        let second_expiry = {
            let entries = cache.inner.entries.lock().await;
            entries.get(&key).unwrap().expires_at.unwrap()
        };
        assert!(second_expiry > first_expiry);

        source.push(Err(Error::Http("connection refused".into())));
        cache.get(&query, force).await.unwrap();
        let after_failure = {
            let entries = cache.inner.entries.lock().await;
            let entry = entries.get(&key).unwrap();
            assert!(entry.last_error.is_some());
            entry.expires_at.unwrap()
        };
        assert_eq!(after_failure, second_expiry);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_entry_within_tolerance_serves_stale() {
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");

        cache.get(&query, CacheReadOptions::default()).await.unwrap();
        assert_eq!(source.calls(), 1);

        // Past the fresh TTL but inside the 60s staleness tolerance.
        tokio::time::advance(Duration::from_secs(15)).await;

        let hit = cache.get(&query, CacheReadOptions::default()).await.unwrap();
        assert_eq!(hit.provenance, Provenance::StaleCache);
        assert!(hit.provenance.stale());
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refetch_falls_back_to_stale_then_fails_after_tolerance() {
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");
        let force = CacheReadOptions {
            force_refresh: true,
            allow_stale: true,
        };

        cache.get(&query, CacheReadOptions::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(15)).await;
        source.push(Err(Error::MbtaApi {
            status: 503,
            message: "upstream sad".into(),
        }));
        let hit = cache.get(&query, force).await.unwrap();
        assert_eq!(hit.provenance, Provenance::StaleAfterFailedRefetch);
        let err = hit.upstream_error.expect("error attached to stale serve");
        assert!(err.contains("503"));

        // Age the entry past the staleness tolerance entirely.
        tokio::time::advance(Duration::from_secs(70)).await;
        source.push(Err(Error::MbtaApi {
            status: 503,
            message: "upstream sad".into(),
        }));
        let result = cache.get(&query, CacheReadOptions::default()).await;
        match result {
            Err(Error::MbtaApi { status, .. }) => assert_eq!(status, 503),
            other => panic!("expected upstream failure, got {:?}", other.map(|h| h.provenance)),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn disallowing_stale_surfaces_the_failure() {
        let source = Arc::new(MockSource::new(Duration::from_millis(10)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");

        cache.get(&query, CacheReadOptions::default()).await.unwrap();
        tokio::time::advance(Duration::from_secs(15)).await;

        source.push(Err(Error::Http("connection refused".into())));
        let opts = CacheReadOptions {
            force_refresh: false,
            allow_stale: false,
        };
        assert!(cache.get(&query, opts).await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_is_a_fetch_failure_for_all_awaiters() {
        // Source slower than the 8s fetch timeout.
        let source = Arc::new(MockSource::new(Duration::from_secs(30)));
        let cache = make_cache(source.clone());
        let query = make_query("stop-a");

        let a = {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { cache.get(&query, CacheReadOptions::default()).await })
        };
        let b = {
            let cache = cache.clone();
            let query = query.clone();
            tokio::spawn(async move { cache.get(&query, CacheReadOptions::default()).await })
        };

        let ra = a.await.unwrap();
        let rb = b.await.unwrap();
        assert!(matches!(ra, Err(Error::Timeout(8))));
        assert!(matches!(rb, Err(Error::Timeout(8))));
    }
}

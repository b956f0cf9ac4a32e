use crate::cache::ChunkStore;
use crate::client::RevisionSource;
use crate::config::{
    FETCH_BACKOFF_BASE_MS, FETCH_BACKOFF_MAX_MS, FETCH_MAX_ATTEMPTS, REQUEST_TIMEOUT_SECS,
};
use crate::error::{ChunkFailure, FetchError};
use crate::models::ChunkResult;
use crate::partition::Chunk;
use crate::stats::PipelineStats;
use dashmap::DashMap;
use rand::Rng;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Bounded exponential backoff for chunk requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Applies to each attempt separately
    pub request_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: FETCH_MAX_ATTEMPTS,
            base_delay: Duration::from_millis(FETCH_BACKOFF_BASE_MS),
            max_delay: Duration::from_millis(FETCH_BACKOFF_MAX_MS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
        }
    }
}

impl RetryPolicy {
    /// Delay before retrying after failed attempt `attempt` (1-based), without jitter.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(20);
        self.base_delay
            .saturating_mul(1u32 << exp)
            .min(self.max_delay)
    }

    /// Backoff plus up to 50% random jitter, still capped at `max_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let backoff = self.backoff(attempt);
        let jitter_ms = (backoff.as_millis() / 2) as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        (backoff + jitter).min(self.max_delay.max(backoff))
    }
}

/// Fetches chunks from a [`RevisionSource`] and persists them to the [`ChunkStore`].
///
/// Cheap to clone; every clone shares the source, store, stats, cancellation
/// token and the in-flight gates.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn RevisionSource>,
    store: Arc<ChunkStore>,
    policy: RetryPolicy,
    cancel: CancellationToken,
    stats: Arc<PipelineStats>,
    /// One gate per chunk index being ensured; at most one request per chunk is outstanding
    in_flight: Arc<DashMap<u64, Arc<Mutex<()>>>>,
}

impl Fetcher {
    pub fn new(
        source: Arc<dyn RevisionSource>,
        store: Arc<ChunkStore>,
        policy: RetryPolicy,
        cancel: CancellationToken,
        stats: Arc<PipelineStats>,
    ) -> Self {
        Self {
            source,
            store,
            policy,
            cancel,
            stats,
            in_flight: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &ChunkStore {
        &self.store
    }

    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Returns the cached chunk, fetching it first if it is missing, corrupt or
    /// stored for another ID range.
    ///
    /// Concurrent callers for the same chunk wait on one gate: the first one
    /// fetches, the others read what it stored.
    pub async fn ensure(&self, chunk: &Chunk) -> Result<ChunkResult, ChunkFailure> {
        if let Some(result) = self.store.read(chunk) {
            self.stats.inc_chunks_cached();
            return Ok(result);
        }

        let gate = self.in_flight.entry(chunk.index).or_default().clone();
        let outcome = {
            let _guard = gate.lock().await;
            match self.store.read(chunk) {
                Some(result) => {
                    self.stats.inc_chunks_cached();
                    Ok(result)
                }
                None => self.fetch(chunk).await,
            }
        };

        drop(gate);
        self.in_flight
            .remove_if(&chunk.index, |_, gate| Arc::strong_count(gate) == 1);
        outcome
    }

    /// Requests the chunk from the source until it succeeds or the retry
    /// budget is spent. Only a successful attempt writes to the store.
    pub async fn fetch(&self, chunk: &Chunk) -> Result<ChunkResult, ChunkFailure> {
        let ids: Vec<u64> = chunk.ids.ids().collect();
        let max_attempts = self.policy.max_attempts.max(1);

        let mut attempt = 0;
        loop {
            attempt += 1;
            if self.cancel.is_cancelled() {
                return Err(ChunkFailure::Cancelled {
                    chunk: chunk.index,
                    ids: chunk.ids,
                });
            }

            let outcome =
                match tokio::time::timeout(self.policy.request_timeout, self.source.fetch_revisions(&ids))
                    .await
                {
                    Ok(outcome) => outcome,
                    Err(_) => Err(FetchError::Timeout(self.policy.request_timeout)),
                };

            let error = match outcome {
                Ok(result) => {
                    self.store
                        .write(chunk, &result)
                        .map_err(|source| ChunkFailure::Persist {
                            chunk: chunk.index,
                            ids: chunk.ids,
                            source,
                        })?;
                    self.stats.inc_chunks_fetched();
                    self.stats.add_missing(result.missing.len() as u64);
                    debug!(chunk = chunk.index, attempt, "Chunk fetched");
                    return Ok(result);
                }
                Err(e) => e,
            };

            if !error.is_transient() {
                return Err(ChunkFailure::Fatal {
                    chunk: chunk.index,
                    ids: chunk.ids,
                    source: error,
                });
            }
            if attempt >= max_attempts {
                return Err(ChunkFailure::Exhausted {
                    chunk: chunk.index,
                    ids: chunk.ids,
                    attempts: attempt,
                    source: error,
                });
            }

            let delay = self.policy.delay(attempt);
            self.stats.inc_retries();
            warn!(
                chunk = chunk.index,
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                error = %error,
                "Chunk fetch failed, retrying"
            );

            tokio::select! {
                _ = self.cancel.cancelled() => {
                    return Err(ChunkFailure::Cancelled {
                        chunk: chunk.index,
                        ids: chunk.ids,
                    });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PageRevisions;
    use crate::partition::IdRange;
    use async_trait::async_trait;
    use serde_json::json;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    /// Plays back scripted failures, then answers with one revision per ID.
    struct ScriptedSource {
        failures: Mutex<VecDeque<FetchError>>,
        calls: AtomicUsize,
        delay: Option<Duration>,
    }

    impl ScriptedSource {
        fn new(failures: Vec<FetchError>) -> Self {
            Self {
                failures: Mutex::new(failures.into()),
                calls: AtomicUsize::new(0),
                delay: None,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl RevisionSource for ScriptedSource {
        async fn fetch_revisions(&self, ids: &[u64]) -> Result<ChunkResult, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if let Some(err) = self.failures.lock().unwrap().pop_front() {
                return Err(err);
            }
            Ok(ChunkResult {
                pages: vec![PageRevisions {
                    pageid: Some(1),
                    ns: Some(0),
                    title: Some("Page".to_string()),
                    revisions: ids.iter().map(|id| json!({"revid": id, "user": "Alice"})).collect(),
                }],
                missing: vec![],
            })
        }
    }

    fn fast_policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            request_timeout: Duration::from_secs(5),
        }
    }

    fn fetcher_for(
        source: Arc<ScriptedSource>,
        dir: &TempDir,
        policy: RetryPolicy,
    ) -> (Fetcher, Arc<PipelineStats>) {
        let store = Arc::new(ChunkStore::open(dir.path()).unwrap());
        let stats = Arc::new(PipelineStats::new());
        let fetcher = Fetcher::new(source, store, policy, CancellationToken::new(), stats.clone());
        (fetcher, stats)
    }

    fn chunk(index: u64, start: u64, end: u64) -> Chunk {
        Chunk {
            index,
            ids: IdRange::new(start, end),
        }
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(1),
        };
        assert_eq!(policy.backoff(1), Duration::from_millis(100));
        assert_eq!(policy.backoff(2), Duration::from_millis(200));
        assert_eq!(policy.backoff(4), Duration::from_millis(800));
        assert_eq!(policy.backoff(5), Duration::from_millis(1000));
        assert_eq!(policy.backoff(60), Duration::from_millis(1000));
    }

    #[test]
    fn jittered_delay_stays_in_bounds() {
        let policy = RetryPolicy {
            max_attempts: 10,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            request_timeout: Duration::from_secs(1),
        };
        for attempt in 1..8 {
            let delay = policy.delay(attempt);
            assert!(delay >= policy.backoff(attempt));
            assert!(delay <= Duration::from_millis(1000));
        }
    }

    #[tokio::test]
    async fn first_attempt_success_persists_chunk() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (fetcher, stats) = fetcher_for(source.clone(), &dir, fast_policy(3));

        let result = fetcher.fetch(&chunk(0, 1, 50)).await.unwrap();
        assert_eq!(result.revision_count(), 50);
        assert_eq!(source.calls(), 1);
        assert_eq!(stats.fetched(), 1);
        assert_eq!(fetcher.store().read(&chunk(0, 1, 50)).unwrap(), result);
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            FetchError::Status(503),
            FetchError::Malformed("truncated".into()),
        ]));
        let (fetcher, stats) = fetcher_for(source.clone(), &dir, fast_policy(5));

        let result = fetcher.fetch(&chunk(2, 101, 120)).await.unwrap();
        assert_eq!(result.revision_count(), 20);
        assert_eq!(source.calls(), 3);
        assert_eq!(stats.retries(), 2);
        assert!(fetcher.store().has(&chunk(2, 101, 120)));
    }

    #[tokio::test]
    async fn exhaustion_is_terminal_and_writes_nothing() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![
            FetchError::RateLimited,
            FetchError::RateLimited,
            FetchError::RateLimited,
        ]));
        let (fetcher, _) = fetcher_for(source.clone(), &dir, fast_policy(3));

        let err = fetcher.fetch(&chunk(4, 201, 250)).await.unwrap_err();
        match err {
            ChunkFailure::Exhausted { chunk, attempts, ids, .. } => {
                assert_eq!(chunk, 4);
                assert_eq!(attempts, 3);
                assert_eq!(ids, IdRange::new(201, 250));
            }
            other => panic!("unexpected failure: {other}"),
        }
        assert_eq!(source.calls(), 3);
        assert!(!fetcher.store().path(4).exists());
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![FetchError::Auth("readapidenied".into())]));
        let (fetcher, _) = fetcher_for(source.clone(), &dir, fast_policy(5));

        let err = fetcher.fetch(&chunk(0, 1, 50)).await.unwrap_err();
        assert!(matches!(err, ChunkFailure::Fatal { .. }));
        assert_eq!(source.calls(), 1);
    }

    #[tokio::test]
    async fn slow_calls_time_out_and_retry() {
        let dir = TempDir::new().unwrap();
        let mut source = ScriptedSource::new(vec![]);
        source.delay = Some(Duration::from_millis(200));
        let source = Arc::new(source);
        let policy = RetryPolicy {
            request_timeout: Duration::from_millis(10),
            ..fast_policy(2)
        };
        let (fetcher, _) = fetcher_for(source.clone(), &dir, policy);

        let err = fetcher.fetch(&chunk(0, 1, 5)).await.unwrap_err();
        match err {
            ChunkFailure::Exhausted { source: FetchError::Timeout(_), .. } => {}
            other => panic!("unexpected failure: {other}"),
        }
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn ensure_uses_cache() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (fetcher, stats) = fetcher_for(source.clone(), &dir, fast_policy(3));

        let first = fetcher.ensure(&chunk(1, 51, 100)).await.unwrap();
        let second = fetcher.ensure(&chunk(1, 51, 100)).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(source.calls(), 1);
        assert_eq!(stats.cached(), 1);
    }

    #[tokio::test]
    async fn concurrent_ensure_sends_one_request() {
        let dir = TempDir::new().unwrap();
        let mut source = ScriptedSource::new(vec![]);
        source.delay = Some(Duration::from_millis(50));
        let source = Arc::new(source);
        let (fetcher, stats) = fetcher_for(source.clone(), &dir, fast_policy(3));

        let target = chunk(0, 1, 50);
        let (a, b, c) = tokio::join!(
            fetcher.ensure(&target),
            fetcher.ensure(&target),
            fetcher.ensure(&target)
        );
        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(c.unwrap().revision_count(), 50);
        assert_eq!(source.calls(), 1);
        assert_eq!(stats.fetched(), 1);
        assert_eq!(stats.cached(), 2);
        assert!(fetcher.in_flight.is_empty());
    }

    #[tokio::test]
    async fn ensure_refetches_chunk_stored_for_shorter_range() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (fetcher, _) = fetcher_for(source.clone(), &dir, fast_policy(3));

        let short = fetcher.ensure(&chunk(2, 101, 120)).await.unwrap();
        assert_eq!(short.revision_count(), 20);
        let grown = fetcher.ensure(&chunk(2, 101, 150)).await.unwrap();
        assert_eq!(grown.revision_count(), 50);
        assert_eq!(source.calls(), 2);
    }

    #[tokio::test]
    async fn cancelled_fetch_stops_before_request() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![]));
        let (fetcher, _) = fetcher_for(source.clone(), &dir, fast_policy(3));
        fetcher.cancel_token().cancel();

        let err = fetcher.fetch(&chunk(0, 1, 50)).await.unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_interrupts_backoff() {
        let dir = TempDir::new().unwrap();
        let source = Arc::new(ScriptedSource::new(vec![FetchError::Status(500)]));
        let policy = RetryPolicy {
            base_delay: Duration::from_secs(60),
            max_delay: Duration::from_secs(60),
            ..fast_policy(3)
        };
        let (fetcher, _) = fetcher_for(source.clone(), &dir, policy);

        let token = fetcher.cancel_token().clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            token.cancel();
        });

        let err = tokio::time::timeout(Duration::from_secs(5), fetcher.fetch(&chunk(0, 1, 50)))
            .await
            .expect("cancellation should end the backoff sleep")
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(source.calls(), 1);
    }
}

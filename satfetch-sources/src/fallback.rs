//! Ordered fallback across imagery sources.
//!
//! Sources are tried one at a time, healthiest first. An authentication
//! failure stops the chain, since the next source would be asked with the
//! same credentials problem. When nothing succeeds the caller gets one
//! aggregated error describing every attempt.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use satfetch_common::error::truncate_chars;
use satfetch_common::stats::DiagnosticsHook;
use satfetch_common::{
    AttemptRecord, DomainError, ErrorKind, FetchError, ImagerySource, LogicalKey, Satellite,
    StatsTracker,
};

/// Sources at or above this many consecutive failures go to the back.
pub const UNHEALTHY_AFTER: u32 = 3;
/// Per-source summary length in the aggregated message.
const SUMMARY_CHARS: usize = 120;
/// Average latency at which the latency term of the score saturates.
const LATENCY_SATURATION: Duration = Duration::from_secs(60);

#[derive(Debug, thiserror::Error)]
#[error("source '{0}' is already registered")]
pub struct DuplicateSource(pub String);

struct Attempt {
    source: String,
    elapsed: Duration,
    error: DomainError,
}

pub struct FallbackOrchestrator {
    name: String,
    sources: Vec<Arc<dyn ImagerySource>>,
    stats: Arc<StatsTracker>,
    token: CancellationToken,
}

impl FallbackOrchestrator {
    pub fn new(token: CancellationToken) -> Self {
        Self {
            name: "fallback".to_string(),
            sources: Vec::new(),
            stats: Arc::new(StatsTracker::new()),
            token,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = stats;
        self
    }

    pub fn with_diagnostics(self, hook: Arc<dyn DiagnosticsHook>) -> Self {
        self.with_stats(Arc::new(StatsTracker::new().with_diagnostics(hook)))
    }

    /// Append a source. Registration order breaks ties in [`ordered_sources`](Self::ordered_sources).
    pub fn register(&mut self, source: Arc<dyn ImagerySource>) -> Result<(), DuplicateSource> {
        if self.sources.iter().any(|s| s.name() == source.name()) {
            return Err(DuplicateSource(source.name().to_string()));
        }
        debug!(source = %source.name(), position = self.sources.len(), "Registered source");
        self.sources.push(source);
        Ok(())
    }

    pub fn sources(&self) -> &[Arc<dyn ImagerySource>] {
        &self.sources
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Failure rate plus up to 0.5 for slowness. Lower is better.
    pub fn score(&self, source: &str) -> f64 {
        let attempts = self.stats.stats(source).map_or(0, |s| s.attempts);
        let metrics = self.stats.metrics(source);
        let latency =
            (metrics.avg_time.as_secs_f64() / LATENCY_SATURATION.as_secs_f64()).min(1.0);
        metrics.failure_rate(attempts) + latency * 0.5
    }

    /// Sources in the order the next call will try them: untried first, then
    /// by ascending score, with unhealthy sources last.
    pub fn ordered_sources(&self) -> Vec<Arc<dyn ImagerySource>> {
        let mut ranked: Vec<(bool, bool, f64, &Arc<dyn ImagerySource>)> = self
            .sources
            .iter()
            .map(|source| {
                let stats = self.stats.stats(source.name()).unwrap_or_default();
                let tried = stats.attempts > 0;
                let unhealthy = stats.consecutive_failures >= UNHEALTHY_AFTER;
                let score = if tried { self.score(source.name()) } else { 0.0 };
                (unhealthy, tried, score, source)
            })
            .collect();
        ranked.sort_by(|a, b| {
            a.0.cmp(&b.0)
                .then(a.1.cmp(&b.1))
                .then(a.2.total_cmp(&b.2))
        });
        ranked.into_iter().map(|(_, _, _, s)| s.clone()).collect()
    }

    fn check_cancelled(&self) -> Result<(), FetchError> {
        if self.token.is_cancelled() {
            Err(FetchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl ImagerySource for FallbackOrchestrator {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &LogicalKey) -> Result<bool, FetchError> {
        for source in self.ordered_sources() {
            self.check_cancelled()?;
            match source.exists(key).await {
                Ok(true) => {
                    debug!(source = %source.name(), key = %key, "Found");
                    return Ok(true);
                }
                Ok(false) => debug!(source = %source.name(), key = %key, "Not available"),
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(FetchError::Domain(e)) => warn!(
                    source = %source.name(),
                    kind = %e.kind(),
                    error = %e,
                    "Existence check failed, trying next source"
                ),
            }
        }
        Ok(false)
    }

    async fn download(&self, key: &LogicalKey, destination: &Path) -> Result<PathBuf, FetchError> {
        let ordered = self.ordered_sources();
        let mut attempts: Vec<Attempt> = Vec::new();
        let mut skipped: Vec<String> = Vec::new();

        for (idx, source) in ordered.iter().enumerate() {
            self.check_cancelled()?;
            let started = Instant::now();
            match source.download(key, destination).await {
                Ok(path) => {
                    let elapsed = started.elapsed();
                    let bytes = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
                    self.stats
                        .update(source.name(), AttemptRecord::success(elapsed, bytes));
                    info!(
                        source = %source.name(),
                        key = %key,
                        elapsed_ms = elapsed.as_millis() as u64,
                        previous_failures = attempts.len(),
                        "Download succeeded"
                    );
                    return Ok(path);
                }
                Err(FetchError::Cancelled) => return Err(FetchError::Cancelled),
                Err(FetchError::Domain(error)) => {
                    let elapsed = started.elapsed();
                    self.stats.update(
                        source.name(),
                        AttemptRecord::failure(
                            elapsed,
                            Some(error.kind()),
                            error.summary(SUMMARY_CHARS),
                        ),
                    );
                    warn!(
                        source = %source.name(),
                        kind = %error.kind(),
                        error = %error,
                        "Download failed"
                    );
                    let auth = error.kind() == ErrorKind::Auth;
                    attempts.push(Attempt {
                        source: source.name().to_string(),
                        elapsed,
                        error,
                    });
                    if auth {
                        skipped = ordered[idx + 1..]
                            .iter()
                            .map(|s| s.name().to_string())
                            .collect();
                        if !skipped.is_empty() {
                            warn!(skipped = ?skipped, "Authentication failure, not trying remaining sources");
                        }
                        break;
                    }
                }
            }
        }

        Err(aggregate(key, &attempts, &skipped).into())
    }

    fn source_url(&self, timestamp: DateTime<Utc>, satellite: Satellite) -> String {
        self.ordered_sources()
            .first()
            .map(|s| s.source_url(timestamp, satellite))
            .unwrap_or_default()
    }

    async fn close(&self) {
        for source in &self.sources {
            source.close().await;
        }
    }
}

/// One error for a whole failed fallback chain.
fn aggregate(key: &LogicalKey, attempts: &[Attempt], skipped: &[String]) -> DomainError {
    let kind = attempts
        .iter()
        .map(|a| a.error.kind())
        .find(|k| *k == ErrorKind::NotFound)
        .unwrap_or(ErrorKind::Unknown);

    let mut message = if attempts.is_empty() {
        format!("Could not download {}: no sources are configured.", key.describe())
    } else {
        format!("Could not download {} from any source:", key.describe())
    };
    for attempt in attempts {
        message.push_str(&format!(
            "\n  ✗ {} ({:.2}s): {}",
            attempt.source,
            attempt.elapsed.as_secs_f64(),
            truncate_chars(attempt.error.message(), SUMMARY_CHARS)
        ));
    }
    for name in skipped {
        message.push_str(&format!("\n  - {} (skipped after authentication failure)", name));
    }

    let mut details = vec![
        format!("key: {}", key),
        format!("time: {}", key.time_components()),
    ];
    for attempt in attempts {
        details.push(String::new());
        details.push(format!(
            "[{}] {} after {:.2}s",
            attempt.source,
            attempt.error.kind(),
            attempt.elapsed.as_secs_f64()
        ));
        details.push(attempt.error.message().to_string());
        for line in attempt.error.technical_details().lines() {
            details.push(format!("  {}", line));
        }
    }
    details.push(String::new());
    details.push("Troubleshooting:".to_string());
    for tip in TROUBLESHOOTING {
        details.push(format!("- {}", tip));
    }

    DomainError::new(
        kind,
        message,
        details.join("\n"),
        ALTERNATIVE_SOURCES.iter().map(|t| t.to_string()).collect(),
        None,
    )
}

const TROUBLESHOOTING: &[&str] = &[
    "Check internet connectivity and that HTTPS to amazonaws.com and noaa.gov is allowed",
    "Confirm the scan time matches the sector cadence and is not in the future",
    "Run with RUST_LOG=debug to see every request and retry",
];

const ALTERNATIVE_SOURCES: &[&str] = &[
    "NOAA CLASS archive: https://www.class.noaa.gov",
    "Google Cloud public buckets: gs://gcp-public-data-goes-16 and gs://gcp-public-data-goes-18",
    "NOAA STAR imagery browser: https://www.star.nesdis.noaa.gov/GOES/",
    "NCEI archive: https://www.ncei.noaa.gov",
];

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    use chrono::TimeZone;
    use satfetch_common::error::classify;
    use satfetch_common::{Band, ErrorContext, ProductType, TransportError};

    #[derive(Clone, Copy)]
    enum Behavior {
        Succeed,
        Missing,
        Fail(ErrorKind),
        Cancel,
    }

    struct MockSource {
        name: String,
        behavior: Behavior,
        exists_calls: AtomicUsize,
        download_calls: AtomicUsize,
        closed: AtomicBool,
    }

    impl MockSource {
        fn new(name: &str, behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                behavior,
                exists_calls: AtomicUsize::new(0),
                download_calls: AtomicUsize::new(0),
                closed: AtomicBool::new(false),
            })
        }

        fn error(&self, kind: ErrorKind, key: &LogicalKey) -> FetchError {
            let raw = match kind {
                ErrorKind::Auth => TransportError::status(403, Some("AccessDenied".into()), "denied"),
                ErrorKind::NotFound => TransportError::status(404, Some("NoSuchKey".into()), "missing"),
                ErrorKind::RateLimited => TransportError::status(429, None, "slow down"),
                ErrorKind::Network => TransportError::Timeout("read timed out".into()),
                ErrorKind::ServerFault => TransportError::status(500, None, "oops"),
                ErrorKind::Unknown => TransportError::Other("weird".into()),
            };
            let target = format!("mock://{}", self.name);
            classify(raw, &ErrorContext::new("download", key, &target)).into()
        }
    }

    #[async_trait]
    impl ImagerySource for MockSource {
        fn name(&self) -> &str {
            &self.name
        }

        async fn exists(&self, key: &LogicalKey) -> Result<bool, FetchError> {
            self.exists_calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => Ok(true),
                Behavior::Missing => Ok(false),
                Behavior::Fail(kind) => Err(self.error(kind, key)),
                Behavior::Cancel => Err(FetchError::Cancelled),
            }
        }

        async fn download(
            &self,
            key: &LogicalKey,
            destination: &Path,
        ) -> Result<PathBuf, FetchError> {
            self.download_calls.fetch_add(1, Ordering::SeqCst);
            match self.behavior {
                Behavior::Succeed => {
                    tokio::fs::write(destination, self.name.as_bytes()).await.unwrap();
                    Ok(destination.to_path_buf())
                }
                Behavior::Missing => Err(self.error(ErrorKind::NotFound, key)),
                Behavior::Fail(kind) => Err(self.error(kind, key)),
                Behavior::Cancel => Err(FetchError::Cancelled),
            }
        }

        fn source_url(&self, _timestamp: DateTime<Utc>, _satellite: Satellite) -> String {
            format!("mock://{}", self.name)
        }

        async fn close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
    }

    fn key() -> LogicalKey {
        LogicalKey::new(
            Utc.with_ymd_and_hms(2023, 6, 15, 12, 1, 0).unwrap(),
            Satellite::Goes16,
            ProductType::RadC,
            Band::new(13).unwrap(),
        )
    }

    fn orchestrator(sources: &[Arc<MockSource>]) -> FallbackOrchestrator {
        let mut orch = FallbackOrchestrator::new(CancellationToken::new());
        for source in sources {
            orch.register(source.clone()).unwrap();
        }
        orch
    }

    fn names(orch: &FallbackOrchestrator) -> Vec<String> {
        orch.ordered_sources()
            .iter()
            .map(|s| s.name().to_string())
            .collect()
    }

    fn ok(ms: u64) -> AttemptRecord {
        AttemptRecord::success(Duration::from_millis(ms), 10)
    }

    fn fail(ms: u64) -> AttemptRecord {
        AttemptRecord::failure(Duration::from_millis(ms), Some(ErrorKind::Network), "down")
    }

    #[test]
    fn test_untried_sources_keep_registration_order() {
        let orch = orchestrator(&[
            MockSource::new("primary", Behavior::Succeed),
            MockSource::new("secondary", Behavior::Succeed),
            MockSource::new("tertiary", Behavior::Succeed),
        ]);
        assert_eq!(names(&orch), vec!["primary", "secondary", "tertiary"]);

        orch.stats().update("primary", ok(100));
        assert_eq!(names(&orch), vec!["secondary", "tertiary", "primary"]);
    }

    #[test]
    fn test_lower_score_first() {
        let orch = orchestrator(&[
            MockSource::new("primary", Behavior::Succeed),
            MockSource::new("secondary", Behavior::Succeed),
        ]);
        orch.stats().update("primary", ok(100));
        orch.stats().update("primary", fail(100));
        orch.stats().update("secondary", ok(100));

        assert!(orch.score("secondary") < orch.score("primary"));
        assert_eq!(names(&orch), vec!["secondary", "primary"]);
    }

    #[test]
    fn test_slow_source_scores_worse() {
        let orch = orchestrator(&[
            MockSource::new("slow", Behavior::Succeed),
            MockSource::new("fast", Behavior::Succeed),
        ]);
        orch.stats().update("slow", ok(120_000));
        orch.stats().update("fast", ok(500));
        assert!((orch.score("slow") - 0.5).abs() < 1e-9);
        assert_eq!(names(&orch), vec!["fast", "slow"]);
    }

    #[test]
    fn test_consecutive_failures_go_last() {
        let orch = orchestrator(&[
            MockSource::new("primary", Behavior::Succeed),
            MockSource::new("secondary", Behavior::Succeed),
        ]);
        for _ in 0..20 {
            orch.stats().update("primary", ok(10));
        }
        for _ in 0..3 {
            orch.stats().update("primary", fail(10));
        }
        orch.stats().update("secondary", ok(10));
        orch.stats().update("secondary", fail(10));
        orch.stats().update("secondary", fail(10));

        assert!(orch.score("primary") < orch.score("secondary"));
        assert_eq!(names(&orch), vec!["secondary", "primary"]);
    }

    #[tokio::test]
    async fn test_falls_back_after_network_failure() {
        let a = MockSource::new("primary", Behavior::Fail(ErrorKind::Network));
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("out.nc");
        let path = orch.download(&key(), &dest).await.unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "secondary");
        assert_eq!(orch.stats().stats("primary").unwrap().consecutive_failures, 1);
        assert_eq!(orch.stats().stats("secondary").unwrap().consecutive_failures, 0);
        assert_eq!(orch.stats().stats("secondary").unwrap().total_bytes, 9);
    }

    #[tokio::test]
    async fn test_auth_failure_stops_chain() {
        let a = MockSource::new("primary", Behavior::Fail(ErrorKind::Auth));
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);

        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();

        assert_eq!(a.download_calls.load(Ordering::SeqCst), 1);
        assert_eq!(b.download_calls.load(Ordering::SeqCst), 0);
        let FetchError::Domain(err) = err else {
            panic!("expected a domain error");
        };
        assert_eq!(err.kind(), ErrorKind::Unknown);
        assert!(err.message().contains("✗ primary"));
        assert!(err.message().contains("secondary (skipped"));
        assert!(orch.stats().stats("secondary").is_none());
    }

    #[tokio::test]
    async fn test_all_failures_are_aggregated() {
        let orch = orchestrator(&[
            MockSource::new("primary", Behavior::Fail(ErrorKind::ServerFault)),
            MockSource::new("secondary", Behavior::Missing),
            MockSource::new("tertiary", Behavior::Fail(ErrorKind::Network)),
        ]);

        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();
        let FetchError::Domain(err) = err else {
            panic!("expected a domain error");
        };

        assert_eq!(err.kind(), ErrorKind::NotFound);
        let message = err.message();
        for name in ["primary", "secondary", "tertiary"] {
            assert!(message.contains(&format!("✗ {name} (")), "{message}");
        }
        assert_eq!(message.matches('✗').count(), 3);
        assert!(message.contains("GOES-16"));
        assert!(message.contains("band 13"));

        let details = err.technical_details();
        assert!(details.contains("[primary] server fault"));
        assert!(details.contains("target: mock://tertiary"));
        assert!(details.contains("Troubleshooting:"));
        assert!(err
            .remediation_tips()
            .iter()
            .any(|t| t.contains("gcp-public-data-goes-16")));
    }

    #[tokio::test]
    async fn test_message_summaries_are_truncated() {
        let orch = orchestrator(&[MockSource::new("primary", Behavior::Missing)]);
        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();
        let FetchError::Domain(err) = err else {
            panic!("expected a domain error");
        };
        let line = err.message().lines().nth(1).unwrap();
        let summary = line.split("): ").nth(1).unwrap();
        assert!(summary.chars().count() <= SUMMARY_CHARS);
    }

    #[tokio::test]
    async fn test_no_sources() {
        let orch = FallbackOrchestrator::new(CancellationToken::new());
        let dir = tempfile::tempdir().unwrap();
        assert!(!orch.exists(&key()).await.unwrap());
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();
        assert_eq!(err.kind(), Some(ErrorKind::Unknown));
        assert_eq!(orch.source_url(key().timestamp, Satellite::Goes16), "");
    }

    #[tokio::test]
    async fn test_exists_skips_failing_sources() {
        let a = MockSource::new("primary", Behavior::Fail(ErrorKind::Network));
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);
        assert!(orch.exists(&key()).await.unwrap());
        assert_eq!(a.exists_calls.load(Ordering::SeqCst), 1);

        let orch = orchestrator(&[
            MockSource::new("primary", Behavior::Fail(ErrorKind::Auth)),
            MockSource::new("secondary", Behavior::Missing),
        ]);
        assert!(!orch.exists(&key()).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_stops_at_first_hit() {
        let a = MockSource::new("primary", Behavior::Succeed);
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);
        assert!(orch.exists(&key()).await.unwrap());
        assert_eq!(b.exists_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_cancellation_is_not_aggregated() {
        let a = MockSource::new("primary", Behavior::Cancel);
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);

        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(b.download_calls.load(Ordering::SeqCst), 0);
        assert!(orch.stats().stats("primary").is_none());

        assert!(orch.exists(&key()).await.unwrap_err().is_cancelled());
    }

    #[tokio::test]
    async fn test_cancelled_token_stops_before_first_source() {
        let a = MockSource::new("primary", Behavior::Succeed);
        let token = CancellationToken::new();
        let mut orch = FallbackOrchestrator::new(token.clone());
        orch.register(a.clone()).unwrap();
        token.cancel();

        let dir = tempfile::tempdir().unwrap();
        let err = orch
            .download(&key(), &dir.path().join("out.nc"))
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
        assert_eq!(a.download_calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_close_and_source_url() {
        let a = MockSource::new("primary", Behavior::Succeed);
        let b = MockSource::new("secondary", Behavior::Succeed);
        let orch = orchestrator(&[a.clone(), b.clone()]);

        assert_eq!(
            orch.source_url(key().timestamp, Satellite::Goes16),
            "mock://primary"
        );
        orch.close().await;
        assert!(a.closed.load(Ordering::SeqCst));
        assert!(b.closed.load(Ordering::SeqCst));
    }

    #[test]
    fn test_duplicate_names_rejected() {
        let mut orch = orchestrator(&[MockSource::new("primary", Behavior::Succeed)]);
        let err = orch
            .register(MockSource::new("primary", Behavior::Missing))
            .unwrap_err();
        assert_eq!(err.0, "primary");
    }

    #[tokio::test]
    async fn test_orchestrator_nests_as_source() {
        let inner = orchestrator(&[MockSource::new("inner", Behavior::Succeed)]).with_name("inner-chain");
        let mut outer = FallbackOrchestrator::new(CancellationToken::new());
        outer.register(Arc::new(inner)).unwrap();
        let dir = tempfile::tempdir().unwrap();
        assert!(outer.download(&key(), &dir.path().join("out.nc")).await.is_ok());
        assert_eq!(outer.stats().stats("inner-chain").unwrap().successes, 1);
    }
}

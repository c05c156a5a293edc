//! HTTP/CDN imagery source.
//!
//! Every key maps to exactly one URL on the imagery CDN, so there is no
//! wildcard fallback. Existence checks are a plain HEAD and treat any
//! failure as absence.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Client, StatusCode};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use satfetch_common::backend::cdn_url;
use satfetch_common::error::{classify, classify_as};
use satfetch_common::retry::retry;
use satfetch_common::{
    ErrorContext, ErrorKind, FetchError, ImagerySource, LogicalKey, ProductType, RetryPolicy,
    Satellite, StatsTracker, TransportError,
};

use super::{record_download, stream_to_file};

pub const DEFAULT_FULL_DISK_RESOLUTION: &str = "5424x5424";
pub const DEFAULT_CONUS_RESOLUTION: &str = "5000x3000";

#[derive(Debug, Clone)]
pub struct CdnConfig {
    pub base_url: String,
    pub default_product: ProductType,
    pub full_disk_resolution: String,
    pub conus_resolution: String,
    pub timeout: Duration,
    pub retry: RetryPolicy,
}

impl CdnConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            default_product: ProductType::RadC,
            full_disk_resolution: DEFAULT_FULL_DISK_RESOLUTION.to_string(),
            conus_resolution: DEFAULT_CONUS_RESOLUTION.to_string(),
            timeout: Duration::from_secs(60),
            retry: RetryPolicy::default(),
        }
    }

    fn resolution(&self, product: ProductType) -> &str {
        match product {
            ProductType::RadF => &self.full_disk_resolution,
            _ => &self.conus_resolution,
        }
    }
}

pub struct HttpSource {
    name: String,
    config: CdnConfig,
    client: Client,
    token: CancellationToken,
    stats: Arc<StatsTracker>,
}

impl HttpSource {
    /// The configured timeout bounds connecting and each idle read; a body
    /// that keeps arriving is never cut off.
    pub fn new(name: impl Into<String>, config: CdnConfig) -> Self {
        let client = Client::builder()
            .connect_timeout(config.timeout)
            .read_timeout(config.timeout)
            .build()
            .expect("Failed to build HTTP client");
        Self {
            name: name.into(),
            config,
            client,
            token: CancellationToken::new(),
            stats: Arc::new(StatsTracker::new()),
        }
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn with_stats(mut self, stats: Arc<StatsTracker>) -> Self {
        self.stats = stats;
        self
    }

    pub fn stats(&self) -> &Arc<StatsTracker> {
        &self.stats
    }

    /// CDN URL for `key`; `None` when the sector is not published there.
    pub fn url_for(&self, key: &LogicalKey) -> Option<String> {
        let sector = key.product.cdn_sector()?;
        Some(cdn_url(
            &self.config.base_url,
            key,
            sector,
            self.config.resolution(key.product),
        ))
    }

    /// HEAD `url`, racing the cancellation token.
    async fn head(&self, url: &str) -> Result<Result<reqwest::Response, reqwest::Error>, FetchError> {
        if self.token.is_cancelled() {
            return Err(FetchError::Cancelled);
        }
        let request = self.client.head(url).timeout(self.config.timeout).send();
        Ok(tokio::select! {
            biased;
            _ = self.token.cancelled() => return Err(FetchError::Cancelled),
            resp = request => resp,
        })
    }

    async fn fetch(
        &self,
        key: &LogicalKey,
        destination: &Path,
    ) -> Result<(PathBuf, u64), FetchError> {
        let Some(url) = self.url_for(key) else {
            let target = format!("{}/{}/ABI/", self.config.base_url, key.satellite.cdn_name());
            let ctx = ErrorContext::new("download", key, &target);
            let raw = TransportError::Other(format!("no CDN sector for {}", key.product));
            return Err(classify_as(ErrorKind::NotFound, raw, &ctx).into());
        };

        let expected = match self.head(&url).await? {
            Ok(resp) if resp.status() == StatusCode::OK => resp.content_length(),
            Ok(resp) => {
                debug!(source = %self.name, url = %url, status = %resp.status(), "HEAD did not return 200");
                None
            }
            Err(e) => {
                debug!(source = %self.name, url = %url, error = %e, "HEAD failed");
                None
            }
        };

        let url_ref = url.as_str();
        let bytes = retry(&self.config.retry, &self.token, move |_| async move {
            let ctx = ErrorContext::new("download", key, url_ref);
            let resp = self
                .client
                .get(url_ref)
                .send()
                .await
                .map_err(|e| classify(e.into(), &ctx))?;

            let status = resp.status();
            if status != StatusCode::OK {
                let raw = TransportError::status(
                    status.as_u16(),
                    None,
                    status.canonical_reason().unwrap_or("unexpected status"),
                );
                return Err(
                    if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
                        classify(raw, &ctx)
                    } else {
                        classify_as(ErrorKind::NotFound, raw, &ctx)
                    },
                );
            }

            stream_to_file(resp, destination)
                .await
                .map_err(|e| classify(e, &ctx))
        })
        .await?;

        if let Some(expected) = expected {
            if expected != bytes {
                warn!(source = %self.name, url = %url, expected, bytes, "Content length mismatch");
            }
        }
        info!(source = %self.name, url = %url, bytes, "Downloaded image");
        Ok((destination.to_path_buf(), bytes))
    }
}

#[async_trait]
impl ImagerySource for HttpSource {
    fn name(&self) -> &str {
        &self.name
    }

    async fn exists(&self, key: &LogicalKey) -> Result<bool, FetchError> {
        let Some(url) = self.url_for(key) else {
            debug!(source = %self.name, product = %key.product, "Sector not published on the CDN");
            return Ok(false);
        };
        match self.head(&url).await? {
            Ok(resp) if resp.status() == StatusCode::OK => Ok(true),
            Ok(resp) => {
                debug!(source = %self.name, url = %url, status = %resp.status(), "Image not available");
                Ok(false)
            }
            Err(e) => {
                debug!(source = %self.name, url = %url, error = %e, "Existence check failed");
                Ok(false)
            }
        }
    }

    async fn download(&self, key: &LogicalKey, destination: &Path) -> Result<PathBuf, FetchError> {
        let started = Instant::now();
        let result = self.fetch(key, destination).await;
        record_download(&self.stats, &self.name, started, &result);
        result.map(|(path, _)| path)
    }

    fn source_url(&self, _timestamp: DateTime<Utc>, satellite: Satellite) -> String {
        match self.config.default_product.cdn_sector() {
            Some(sector) => format!(
                "{}/{}/ABI/{}/",
                self.config.base_url,
                satellite.cdn_name(),
                sector
            ),
            None => format!("{}/{}/ABI/", self.config.base_url, satellite.cdn_name()),
        }
    }

    async fn close(&self) {
        debug!(source = %self.name, "Closing CDN source");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{unreachable_url, FakeResponse, FakeServer};
    use chrono::TimeZone;
    use satfetch_common::Band;

    const IMAGE_PATH: &str = "/GOES16/ABI/CONUS/13/20231661201_GOES16-ABI-CONUS-13-5000x3000.jpg";

    fn key(product: ProductType) -> LogicalKey {
        LogicalKey::new(
            Utc.with_ymd_and_hms(2023, 6, 15, 12, 1, 0).unwrap(),
            Satellite::Goes16,
            product,
            Band::new(13).unwrap(),
        )
    }

    fn source(base_url: &str) -> HttpSource {
        let mut config = CdnConfig::new(base_url);
        config.timeout = Duration::from_secs(5);
        config.retry = RetryPolicy::new(2, Duration::ZERO, 0.0);
        HttpSource::new("secondary", config)
    }

    #[test]
    fn test_url_for_sectors() {
        let source = source("https://cdn.star.nesdis.noaa.gov/");
        assert_eq!(
            source.url_for(&key(ProductType::RadC)).unwrap(),
            format!("https://cdn.star.nesdis.noaa.gov{}", IMAGE_PATH)
        );
        assert!(source
            .url_for(&key(ProductType::RadF))
            .unwrap()
            .ends_with("/GOES16/ABI/FD/13/20231661201_GOES16-ABI-FD-13-5424x5424.jpg"));
        assert_eq!(source.url_for(&key(ProductType::RadM)), None);
        assert_eq!(
            source.source_url(key(ProductType::RadC).timestamp, Satellite::Goes18),
            "https://cdn.star.nesdis.noaa.gov/GOES18/ABI/CONUS/"
        );
    }

    #[tokio::test]
    async fn test_exists_follows_head_status() {
        let server = FakeServer::spawn(|_method, path, _query| match path {
            IMAGE_PATH => FakeResponse::ok("jpeg"),
            p if p.contains("/FD/") => FakeResponse::new(500, ""),
            _ => FakeResponse::new(404, ""),
        })
        .await;

        let source = source(&server.url);
        assert!(source.exists(&key(ProductType::RadC)).await.unwrap());
        assert!(!source.exists(&key(ProductType::RadF)).await.unwrap());
        assert!(!source.exists(&key(ProductType::RadM)).await.unwrap());
        assert_eq!(server.count("HEAD "), 2);
    }

    #[tokio::test]
    async fn test_exists_false_when_unreachable() {
        let source = source(&unreachable_url().await);
        assert!(!source.exists(&key(ProductType::RadC)).await.unwrap());
    }

    #[tokio::test]
    async fn test_exists_propagates_cancellation() {
        let server = FakeServer::spawn(|_method, _path, _query| FakeResponse::ok("")).await;
        let token = CancellationToken::new();
        token.cancel();
        let source = source(&server.url).with_cancellation(token);
        let err = source.exists(&key(ProductType::RadC)).await.unwrap_err();
        assert!(err.is_cancelled());
    }

    #[tokio::test]
    async fn test_download_streams_to_nested_destination() {
        let image: Vec<u8> = (0..200 * 1024).map(|i| (i % 251) as u8).collect();
        let served = image.clone();
        let server = FakeServer::spawn(move |_method, path, _query| match path {
            IMAGE_PATH => FakeResponse::ok(served.clone()),
            _ => FakeResponse::new(404, ""),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b/image.jpg");
        let source = source(&server.url);
        let path = source
            .download(&key(ProductType::RadC), &dest)
            .await
            .unwrap();

        assert_eq!(path, dest);
        assert_eq!(std::fs::read(&dest).unwrap(), image);
        assert_eq!(std::fs::read_dir(dir.path().join("a/b")).unwrap().count(), 1);
        assert_eq!(server.count("HEAD "), 1);
        assert_eq!(server.count("GET "), 1);

        let stats = source.stats().stats("secondary").unwrap();
        assert_eq!(stats.successes, 1);
        assert_eq!(stats.total_bytes, image.len() as u64);
    }

    #[tokio::test]
    async fn test_slow_steady_body_is_not_cut_off() {
        let server = FakeServer::spawn(|method, path, _query| match (method.as_str(), path) {
            ("GET", IMAGE_PATH) => FakeResponse::ok("8 bytes!").trickled(Duration::from_millis(300)),
            (_, IMAGE_PATH) => FakeResponse::ok(""),
            _ => FakeResponse::new(404, ""),
        })
        .await;

        let mut config = CdnConfig::new(&server.url);
        config.timeout = Duration::from_secs(1);
        config.retry = RetryPolicy::new(0, Duration::ZERO, 0.0);
        let source = HttpSource::new("secondary", config);

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image.jpg");
        source.download(&key(ProductType::RadC), &dest).await.unwrap();
        assert_eq!(std::fs::read_to_string(&dest).unwrap(), "8 bytes!");
    }

    #[tokio::test]
    async fn test_download_non_200_is_not_found() {
        let server = FakeServer::spawn(|_method, _path, _query| FakeResponse::new(403, "")).await;

        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("image.jpg");
        let err = source(&server.url)
            .download(&key(ProductType::RadC), &dest)
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::NotFound));
        assert_eq!(server.count("GET "), 1);
        assert!(!dest.exists());
    }

    #[tokio::test]
    async fn test_download_server_errors_are_retried() {
        let server = FakeServer::spawn(|method, _path, _query| match method.as_str() {
            "HEAD" => FakeResponse::ok(""),
            _ => FakeResponse::new(503, ""),
        })
        .await;

        let dir = tempfile::tempdir().unwrap();
        let source = source(&server.url);
        let err = source
            .download(&key(ProductType::RadC), &dir.path().join("image.jpg"))
            .await
            .unwrap_err();

        assert_eq!(err.kind(), Some(ErrorKind::ServerFault));
        assert_eq!(server.count("GET "), 3);
        let stats = source.stats().stats("secondary").unwrap();
        assert_eq!(stats.failures, 1);
        assert_eq!(stats.consecutive_failures, 1);
    }

    #[tokio::test]
    async fn test_download_mesoscale_is_not_found() {
        let server = FakeServer::spawn(|_method, _path, _query| FakeResponse::ok("")).await;
        let dir = tempfile::tempdir().unwrap();
        let err = source(&server.url)
            .download(&key(ProductType::RadM), &dir.path().join("image.jpg"))
            .await
            .unwrap_err();
        let FetchError::Domain(err) = err else {
            panic!("expected a domain error");
        };
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert!(err.message().contains("GOES-16"));
        assert!(server.requests().is_empty());
    }
}

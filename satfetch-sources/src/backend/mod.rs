pub mod cdn;
pub mod s3;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use reqwest::Response;
use satfetch_common::stats::DiagnosticsHook;
use satfetch_common::{AttemptRecord, FetchError, ImagerySource, StatsTracker, TransportError};
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::config::{FetchConfig, SourceConfig, SourceKind, DEFAULT_CDN_BASE_URL};
use crate::diagnostics::NetworkDiagnostics;
use crate::fallback::FallbackOrchestrator;

use self::cdn::{CdnConfig, HttpSource};
use self::s3::{ObjectStoreSource, S3Config, S3Credentials};

/// Write buffer size for streamed downloads.
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Construct one source from its configuration entry.
///
/// Pass `diagnostics` only for a source used on its own; inside a chain the
/// chain's tracker triggers them.
pub fn from_source_config(
    config: &SourceConfig,
    token: &CancellationToken,
    diagnostics: Option<Arc<dyn DiagnosticsHook>>,
) -> anyhow::Result<Arc<dyn ImagerySource>> {
    let mut stats = StatsTracker::new();
    if let Some(hook) = diagnostics {
        stats = stats.with_diagnostics(hook);
    }
    let stats = Arc::new(stats);

    match config.kind {
        SourceKind::S3 => {
            // Unsigned unless both halves are configured explicitly.
            let credentials = match (&config.access_key_id, &config.secret_access_key) {
                (Some(kid), Some(secret)) if !kid.is_empty() && !secret.is_empty() => {
                    Some(S3Credentials {
                        access_key_id: kid.clone(),
                        secret_access_key: secret.clone(),
                    })
                }
                (None, None) => None,
                _ => anyhow::bail!(
                    "S3 credentials for source '{}' are incomplete",
                    config.name
                ),
            };
            let s3_config = S3Config {
                endpoint: config.endpoint.clone(),
                region: config.region.clone(),
                credentials,
                default_product: config.default_product,
                timeout: config.timeout(),
                retry: config.retry_policy(),
            };
            Ok(Arc::new(
                ObjectStoreSource::new(config.name.clone(), s3_config)
                    .with_cancellation(token.clone())
                    .with_stats(stats),
            ))
        }
        SourceKind::Cdn => {
            let mut cdn_config = CdnConfig::new(
                config
                    .base_url
                    .clone()
                    .unwrap_or_else(|| DEFAULT_CDN_BASE_URL.to_string()),
            );
            cdn_config.default_product = config.default_product;
            cdn_config.timeout = config.timeout();
            cdn_config.retry = config.retry_policy();
            if let Some(res) = &config.full_disk_resolution {
                cdn_config.full_disk_resolution = res.clone();
            }
            if let Some(res) = &config.conus_resolution {
                cdn_config.conus_resolution = res.clone();
            }
            Ok(Arc::new(
                HttpSource::new(config.name.clone(), cdn_config)
                    .with_cancellation(token.clone())
                    .with_stats(stats),
            ))
        }
    }
}

/// Build the fallback chain for every enabled source, in file order.
pub fn from_config(
    config: &FetchConfig,
    token: CancellationToken,
) -> anyhow::Result<FallbackOrchestrator> {
    config.validate()?;

    let diagnostics: Arc<dyn DiagnosticsHook> =
        Arc::new(NetworkDiagnostics::new(diagnostic_hosts(config)));

    let mut orchestrator =
        FallbackOrchestrator::new(token.clone()).with_diagnostics(diagnostics);
    // Source trackers see the same download calls, so only the chain's
    // tracker triggers diagnostics.
    for source_config in config.enabled_sources() {
        let source = from_source_config(source_config, &token, None)?;
        orchestrator.register(source)?;
    }
    Ok(orchestrator)
}

fn diagnostic_hosts(config: &FetchConfig) -> Vec<String> {
    let mut hosts: Vec<String> = config
        .enabled_sources()
        .map(|s| match s.kind {
            SourceKind::S3 => s3::url_host(
                &s.endpoint
                    .clone()
                    .unwrap_or_else(|| s3::default_endpoint(&s.region)),
            ),
            SourceKind::Cdn => s3::url_host(
                s.base_url.as_deref().unwrap_or(DEFAULT_CDN_BASE_URL),
            ),
        })
        .collect();
    hosts.sort();
    hosts.dedup();
    hosts
}

/// Distinguishes partial files of concurrent downloads within one process.
static PARTIAL_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temporary download file removed on drop unless committed.
struct PartialFile {
    path: PathBuf,
    committed: bool,
}

impl PartialFile {
    /// `<name>.<pid>.<seq>.part` next to `destination`, unique per call.
    fn for_destination(destination: &Path) -> Self {
        let mut name = destination
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        let seq = PARTIAL_SEQ.fetch_add(1, Ordering::Relaxed);
        name.push(format!(".{}.{}.part", std::process::id(), seq));
        Self {
            path: destination.with_file_name(name),
            committed: false,
        }
    }
}

impl Drop for PartialFile {
    fn drop(&mut self) {
        if !self.committed {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

/// Stream a response body to `destination` through a `.part` file and an
/// atomic rename. Returns the number of bytes written.
pub(crate) async fn stream_to_file(
    mut resp: Response,
    destination: &Path,
) -> Result<u64, TransportError> {
    if let Some(parent) = destination.parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent).await?;
        }
    }

    let mut partial = PartialFile::for_destination(destination);
    let file = tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(&partial.path)
        .await?;
    let mut writer = BufWriter::with_capacity(CHUNK_SIZE, file);

    let mut written = 0u64;
    while let Some(chunk) = resp.chunk().await? {
        writer.write_all(&chunk).await?;
        written += chunk.len() as u64;
    }
    writer.flush().await?;
    writer.get_mut().sync_all().await?;
    drop(writer);

    tokio::fs::rename(&partial.path, destination).await?;
    partial.committed = true;

    debug!(path = %destination.display(), bytes = written, "Download written");
    Ok(written)
}

/// Report one download call to the source's tracker. Cancelled calls are not recorded.
pub(crate) fn record_download(
    stats: &StatsTracker,
    source: &str,
    started: Instant,
    result: &Result<(PathBuf, u64), FetchError>,
) {
    let elapsed = started.elapsed();
    match result {
        Ok((_, bytes)) => stats.update(source, AttemptRecord::success(elapsed, *bytes)),
        Err(FetchError::Domain(e)) => stats.update(
            source,
            AttemptRecord::failure(elapsed, Some(e.kind()), e.summary(200)),
        ),
        Err(FetchError::Cancelled) => {}
    }
}

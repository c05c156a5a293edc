use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};

use crate::error::FetchError;
use crate::key::{scan_time_compact, LogicalKey, ProductType, Satellite};

/// Capability implemented by every imagery source.
///
/// Concrete backends (object store, CDN) and the fallback orchestrator all
/// expose the same four operations, so callers never need to know which one
/// they are talking to. Not-found is a `false` from [`exists`] but an error
/// from [`download`].
///
/// [`exists`]: ImagerySource::exists
/// [`download`]: ImagerySource::download
#[async_trait::async_trait]
pub trait ImagerySource: Send + Sync {
    /// Stable identity used as the statistics key.
    fn name(&self) -> &str;

    /// Whether the object for `key` is available from this source.
    async fn exists(&self, key: &LogicalKey) -> Result<bool, FetchError>;

    /// Fetch the object for `key` into `destination` and return the written path.
    async fn download(&self, key: &LogicalKey, destination: &Path) -> Result<PathBuf, FetchError>;

    /// Where this source would look for data at `timestamp`, for diagnostics.
    fn source_url(&self, timestamp: DateTime<Utc>, satellite: Satellite) -> String;

    /// Release backend sessions. The source may be used again afterwards.
    async fn close(&self);
}

/// Object-store directory for a key.
/// Scheme: `{product}/{YYYY}/{JJJ}/{HH}/`
pub fn object_prefix(key: &LogicalKey) -> String {
    product_prefix(key.product, &key.timestamp)
}

pub fn product_prefix(product: ProductType, timestamp: &DateTime<Utc>) -> String {
    format!(
        "{}/{}/",
        product.object_store_name(),
        timestamp.format("%Y/%j/%H")
    )
}

/// Canonical short object name probed before falling back to a listing.
/// Scheme: `{prefix}OR_{product}-M6C{BB}_{sat}_s{YYYYJJJHHMMSS}0.nc`
///
/// Mesoscale names carry the sector number; the exact lookup assumes sector 1.
pub fn exact_object_key(key: &LogicalKey) -> String {
    let product = match key.product {
        ProductType::RadM => format!("{}1", key.product.object_store_name()),
        _ => key.product.object_store_name().to_string(),
    };
    format!(
        "{}OR_{}-M6C{}_{}_s{}0.nc",
        object_prefix(key),
        product,
        key.band,
        key.satellite.code(),
        key.timestamp.format("%Y%j%H%M%S")
    )
}

/// Regular expression matched against file names listed under [`object_prefix`].
///
/// Scan mode and the seconds of the start time vary, so only the product,
/// channel, satellite code and start token down to the minute are pinned.
/// Mesoscale files live under `ABI-L1b-RadM/` but are named `RadM1` or `RadM2`.
pub fn filename_pattern(key: &LogicalKey) -> String {
    let sector = match key.product {
        ProductType::RadM => r"[12]",
        _ => "",
    };
    format!(
        r"^OR_{}{}-M\d+C{}_{}_{}\d*_e\d+_c\d+\.nc$",
        key.product.object_store_name(),
        sector,
        key.band,
        key.satellite.code(),
        key.start_token()
    )
}

/// Single deterministic CDN URL for a sector image.
/// Scheme: `{base}/{SAT}/ABI/{SECTOR}/{BB}/{YYYYJJJHHMM}_{SAT}-ABI-{SECTOR}-{BB}-{resolution}.jpg`
pub fn cdn_url(base: &str, key: &LogicalKey, sector: &str, resolution: &str) -> String {
    let sat = key.satellite.cdn_name();
    format!(
        "{}/{sat}/ABI/{sector}/{band}/{time}_{sat}-ABI-{sector}-{band}-{resolution}.jpg",
        base.trim_end_matches('/'),
        band = key.band,
        time = scan_time_compact(&key.timestamp),
    )
}

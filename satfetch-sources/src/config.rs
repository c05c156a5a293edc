use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use satfetch_common::retry::MAX_BACKOFF;
use satfetch_common::{ProductType, RetryPolicy};

pub const DEFAULT_S3_REGION: &str = "us-east-1";
pub const DEFAULT_CDN_BASE_URL: &str = "https://cdn.star.nesdis.noaa.gov";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    S3,
    Cdn,
}

/// One entry of the ordered `[[sources]]` list.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: SourceKind,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_initial_backoff_secs")]
    pub initial_backoff_secs: f64,
    #[serde(default = "default_jitter_fraction")]
    pub jitter_fraction: f64,
    /// Product used by `source_url` when no key is at hand.
    #[serde(default = "default_product")]
    pub default_product: ProductType,

    // s3
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub access_key_id: Option<String>,
    #[serde(default)]
    pub secret_access_key: Option<String>,

    // cdn
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub full_disk_resolution: Option<String>,
    #[serde(default)]
    pub conus_resolution: Option<String>,
}

fn default_enabled() -> bool {
    true
}

fn default_timeout_secs() -> u64 {
    60
}

fn default_max_retries() -> u32 {
    3
}

fn default_initial_backoff_secs() -> f64 {
    1.0
}

fn default_jitter_fraction() -> f64 {
    0.1
}

fn default_product() -> ProductType {
    ProductType::RadC
}

fn default_region() -> String {
    DEFAULT_S3_REGION.to_string()
}

impl SourceConfig {
    pub fn new(name: impl Into<String>, kind: SourceKind) -> Self {
        Self {
            name: name.into(),
            kind,
            enabled: default_enabled(),
            timeout_secs: default_timeout_secs(),
            max_retries: default_max_retries(),
            initial_backoff_secs: default_initial_backoff_secs(),
            jitter_fraction: default_jitter_fraction(),
            default_product: default_product(),
            endpoint: None,
            region: default_region(),
            access_key_id: None,
            secret_access_key: None,
            base_url: None,
            full_disk_resolution: None,
            conus_resolution: None,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    /// Backoff is clamped to `[0, MAX_BACKOFF]`, so unvalidated values never panic.
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff_secs = self
            .initial_backoff_secs
            .min(MAX_BACKOFF.as_secs_f64())
            .max(0.0);
        RetryPolicy::new(
            self.max_retries,
            Duration::from_secs_f64(backoff_secs),
            self.jitter_fraction,
        )
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.name.trim().is_empty() {
            anyhow::bail!("source name must not be empty");
        }
        if self.timeout_secs == 0 {
            anyhow::bail!("source '{}': timeout_secs must be positive", self.name);
        }
        if !self.initial_backoff_secs.is_finite() || self.initial_backoff_secs < 0.0 {
            anyhow::bail!(
                "source '{}': initial_backoff_secs must be a non-negative number",
                self.name
            );
        }
        if self.initial_backoff_secs > MAX_BACKOFF.as_secs_f64() {
            anyhow::bail!(
                "source '{}': initial_backoff_secs must not exceed {} seconds",
                self.name,
                MAX_BACKOFF.as_secs()
            );
        }
        if !(0.0..=1.0).contains(&self.jitter_fraction) {
            anyhow::bail!(
                "source '{}': jitter_fraction must be between 0 and 1",
                self.name
            );
        }
        if self.access_key_id.is_some() != self.secret_access_key.is_some() {
            anyhow::bail!(
                "source '{}': access_key_id and secret_access_key must be set together",
                self.name
            );
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct FetchConfig {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

impl Default for FetchConfig {
    /// Public object store first, imagery CDN second.
    fn default() -> Self {
        Self {
            sources: vec![
                SourceConfig::new("primary", SourceKind::S3),
                SourceConfig::new("secondary", SourceKind::Cdn),
            ],
        }
    }
}

impl FetchConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read {}: {}", path.display(), e))?;
        let config: FetchConfig = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse {}: {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut seen = HashSet::new();
        for source in &self.sources {
            source.validate()?;
            if !seen.insert(source.name.as_str()) {
                anyhow::bail!("duplicate source name '{}'", source.name);
            }
        }
        if !self.sources.iter().any(|s| s.enabled) {
            anyhow::bail!("at least one source must be enabled");
        }
        Ok(())
    }

    /// Enabled sources in registration order.
    pub fn enabled_sources(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

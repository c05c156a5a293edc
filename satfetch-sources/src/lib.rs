//! Imagery sources: the S3 object store, the imagery CDN, and the fallback
//! chain that ties them together, plus TOML configuration for all three.

pub mod backend;
pub mod config;
pub mod diagnostics;
pub mod fallback;

#[cfg(test)]
pub(crate) mod testing;

pub use backend::cdn::{CdnConfig, HttpSource};
pub use backend::s3::{ObjectStoreSource, S3Config, S3Credentials};
pub use backend::{from_config, from_source_config};
pub use config::{FetchConfig, SourceConfig, SourceKind};
pub use diagnostics::NetworkDiagnostics;
pub use fallback::FallbackOrchestrator;

//! Shared model for satellite imagery acquisition: logical keys, the source
//! capability trait, the error taxonomy, retry policy and per-source statistics.

pub mod backend;
pub mod error;
pub mod key;
pub mod retry;
pub mod stats;

pub use backend::ImagerySource;
pub use error::{DomainError, ErrorContext, ErrorKind, FetchError, TransportError};
pub use key::{Band, LogicalKey, ProductType, Satellite};
pub use retry::RetryPolicy;
pub use stats::{AttemptRecord, SourceStats, StatsTracker};

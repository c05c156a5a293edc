//! Logical identity of an imagery object, independent of any backend.
//!
//! A [`LogicalKey`] names one ABI Level-1b observation: which satellite,
//! which scan sector, which channel, and the nominal scan start time.
//! Backends derive their concrete object paths or URLs from it.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("unknown satellite `{0}` (expected GOES-16, GOES-18 or GOES-19)")]
    UnknownSatellite(String),
    #[error("unknown product `{0}` (expected RadF, RadC or RadM)")]
    UnknownProduct(String),
    #[error("band {0} is outside the ABI channel range 1-16")]
    BandOutOfRange(u8),
    #[error("invalid band `{0}`")]
    InvalidBand(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Satellite {
    Goes16,
    Goes18,
    Goes19,
}

impl Satellite {
    /// Short code used inside object file names, e.g. `G16`.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Goes16 => "G16",
            Self::Goes18 => "G18",
            Self::Goes19 => "G19",
        }
    }

    /// Public object-store bucket holding this satellite's data.
    pub fn bucket(&self) -> &'static str {
        match self {
            Self::Goes16 => "noaa-goes16",
            Self::Goes18 => "noaa-goes18",
            Self::Goes19 => "noaa-goes19",
        }
    }

    /// Directory name used by the imagery CDN, e.g. `GOES16`.
    pub fn cdn_name(&self) -> &'static str {
        match self {
            Self::Goes16 => "GOES16",
            Self::Goes18 => "GOES18",
            Self::Goes19 => "GOES19",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Goes16 => "GOES-16",
            Self::Goes18 => "GOES-18",
            Self::Goes19 => "GOES-19",
        }
    }
}

impl fmt::Display for Satellite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

impl FromStr for Satellite {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_ascii_uppercase();
        let digits = normalized
            .strip_prefix("GOES")
            .or_else(|| normalized.strip_prefix('G'))
            .unwrap_or(&normalized);
        match digits {
            "16" | "EAST" => Ok(Self::Goes16),
            "18" | "WEST" => Ok(Self::Goes18),
            "19" => Ok(Self::Goes19),
            _ => Err(KeyError::UnknownSatellite(s.to_string())),
        }
    }
}

/// ABI Level-1b radiance product, one per scan sector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProductType {
    /// Full disk.
    RadF,
    /// Continental US.
    RadC,
    /// Mesoscale.
    RadM,
}

impl ProductType {
    /// Product directory name in the object store, e.g. `ABI-L1b-RadC`.
    pub fn object_store_name(&self) -> &'static str {
        match self {
            Self::RadF => "ABI-L1b-RadF",
            Self::RadC => "ABI-L1b-RadC",
            Self::RadM => "ABI-L1b-RadM",
        }
    }

    /// Sector directory used by the CDN. Mesoscale imagery is not published there.
    pub fn cdn_sector(&self) -> Option<&'static str> {
        match self {
            Self::RadF => Some("FD"),
            Self::RadC => Some("CONUS"),
            Self::RadM => None,
        }
    }
}

impl fmt::Display for ProductType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.object_store_name())
    }
}

impl FromStr for ProductType {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let upper = s.to_ascii_uppercase();
        let short = upper.strip_prefix("ABI-L1B-").unwrap_or(&upper);
        match short {
            "RADF" | "FD" | "FULLDISK" | "FULL_DISK" => Ok(Self::RadF),
            "RADC" | "CONUS" => Ok(Self::RadC),
            "RADM" | "MESO" | "MESOSCALE" => Ok(Self::RadM),
            _ => Err(KeyError::UnknownProduct(s.to_string())),
        }
    }
}

/// ABI channel number, always within 1..=16.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Band(u8);

impl Band {
    pub fn new(channel: u8) -> Result<Self, KeyError> {
        if (1..=16).contains(&channel) {
            Ok(Self(channel))
        } else {
            Err(KeyError::BandOutOfRange(channel))
        }
    }

    pub fn number(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Band {
    type Error = KeyError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Band> for u8 {
    fn from(band: Band) -> Self {
        band.0
    }
}

impl fmt::Display for Band {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}", self.0)
    }
}

impl FromStr for Band {
    type Err = KeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim_start_matches(['C', 'c']);
        let channel: u8 = trimmed
            .parse()
            .map_err(|_| KeyError::InvalidBand(s.to_string()))?;
        Self::new(channel)
    }
}

/// The (timestamp, satellite, product, band) tuple identifying a desired object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LogicalKey {
    pub timestamp: DateTime<Utc>,
    pub satellite: Satellite,
    pub product: ProductType,
    pub band: Band,
}

impl LogicalKey {
    pub fn new(
        timestamp: DateTime<Utc>,
        satellite: Satellite,
        product: ProductType,
        band: Band,
    ) -> Self {
        Self {
            timestamp,
            satellite,
            product,
            band,
        }
    }

    pub fn year(&self) -> i32 {
        self.timestamp.year()
    }

    pub fn day_of_year(&self) -> u32 {
        self.timestamp.ordinal()
    }

    pub fn hour(&self) -> u32 {
        self.timestamp.hour()
    }

    pub fn minute(&self) -> u32 {
        self.timestamp.minute()
    }

    /// Scan start token to minute precision: `s{YYYY}{JJJ}{HH}{MM}`.
    pub fn start_token(&self) -> String {
        format!("s{}", scan_time_compact(&self.timestamp))
    }

    /// `year=2023 day_of_year=166 hour=12 minute=01`, used in error details.
    pub fn time_components(&self) -> String {
        format!(
            "year={} day_of_year={:03} hour={:02} minute={:02}",
            self.year(),
            self.day_of_year(),
            self.hour(),
            self.minute()
        )
    }

    /// Human description naming satellite, product, band and time.
    pub fn describe(&self) -> String {
        format!(
            "{} {} band {} at {}",
            self.satellite,
            self.product,
            self.band,
            self.timestamp.format("%Y-%m-%d %H:%M UTC")
        )
    }
}

impl fmt::Display for LogicalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}/{}/C{}/{}",
            self.satellite.code(),
            self.product,
            self.band,
            self.timestamp.format("%Y%j%H%M")
        )
    }
}

/// `{YYYY}{JJJ}{HH}{MM}` with zero-padded day of year.
pub fn scan_time_compact(timestamp: &DateTime<Utc>) -> String {
    timestamp.format("%Y%j%H%M").to_string()
}

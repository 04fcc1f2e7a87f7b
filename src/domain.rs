use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, Utc};
use clap::ValueEnum;
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::FlowError;
use crate::geometry::GeoBox;

static PRODUCT_ID_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9_.-]*$").unwrap());
static TILE_IN_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"_T(\d{2}[A-Z]{3})(_|$)").unwrap());

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ProductId(String);

impl ProductId {
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// MGRS tile embedded in a Sentinel-2 product name, e.g. `_T32TMS_`.
    pub fn embedded_tile(&self) -> Option<TileId> {
        TILE_IN_NAME_RE
            .captures(&self.0)
            .and_then(|caps| caps.get(1))
            .map(|m| TileId(m.as_str().to_string()))
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ProductId {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim().trim_end_matches(".SAFE");
        if !PRODUCT_ID_RE.is_match(trimmed) {
            return Err(FlowError::InvalidProductId(value.to_string()));
        }
        Ok(Self(trimmed.to_string()))
    }
}

impl TryFrom<String> for ProductId {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ProductId> for String {
    fn from(value: ProductId) -> Self {
        value.0
    }
}

/// Sentinel-2 MGRS tile identifier such as `32TMS`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TileId(String);

impl TileId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for TileId {
    type Err = FlowError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let normalized = value.trim().trim_start_matches(['T', 't']).to_uppercase();
        let bytes = normalized.as_bytes();
        let is_valid = bytes.len() == 5
            && bytes[..2].iter().all(u8::is_ascii_digit)
            && bytes[2..].iter().all(u8::is_ascii_uppercase);
        if !is_valid {
            return Err(FlowError::InvalidFilter(format!("tile id {value}")));
        }
        Ok(Self(normalized))
    }
}

impl TryFrom<String> for TileId {
    type Error = FlowError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<TileId> for String {
    fn from(value: TileId) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Platform {
    Sentinel2,
    Sentinel1,
}

impl Platform {
    pub fn collection(self) -> &'static str {
        match self {
            Platform::Sentinel2 => "sentinel-2-l1c",
            Platform::Sentinel1 => "sentinel-1-grd",
        }
    }

    pub fn has_cloud_cover(self) -> bool {
        matches!(self, Platform::Sentinel2)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.collection())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "UPPERCASE")]
pub enum BandSet {
    #[value(name = "RGB", alias = "rgb")]
    Rgb,
    #[value(name = "IRG", alias = "irg")]
    Irg,
    #[value(name = "VVH", alias = "vvh")]
    Vvh,
}

impl BandSet {
    /// Band names in output channel order.
    pub fn bands(self) -> [&'static str; 3] {
        match self {
            BandSet::Rgb => ["B04", "B03", "B02"],
            BandSet::Irg => ["B08", "B04", "B03"],
            BandSet::Vvh => ["VV", "VH", "VV"],
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            BandSet::Rgb => "RGB",
            BandSet::Irg => "IRG",
            BandSet::Vvh => "VVH",
        }
    }

    pub fn for_platform(self, platform: Platform) -> BandSet {
        match platform {
            Platform::Sentinel1 => BandSet::Vvh,
            Platform::Sentinel2 if self == BandSet::Vvh => BandSet::Rgb,
            Platform::Sentinel2 => self,
        }
    }
}

impl fmt::Display for BandSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.label())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    #[default]
    Nearest,
    Bilinear,
}

/// One catalog-indexed acquisition. Immutable once returned by a catalog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ProductId,
    pub platform: Platform,
    pub sensed_at: DateTime<Utc>,
    pub footprint: GeoBox,
    #[serde(default)]
    pub cloud_cover: Option<f64>,
    #[serde(default)]
    pub tile: Option<TileId>,
    #[serde(default)]
    pub bands: Vec<String>,
    pub url: String,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub checksum: Option<String>,
}

impl Product {
    pub fn sensing_date(&self) -> NaiveDate {
        self.sensed_at.date_naive()
    }

    /// Cloud cover used for ranking; radar products count as clear.
    pub fn cloud_cover_or_zero(&self) -> f64 {
        self.cloud_cover.unwrap_or(0.0)
    }

    /// Satellite unit, taken from the product name prefix (`S2A`, `S1B`, ...).
    pub fn unit(&self) -> &str {
        self.id
            .as_str()
            .split('_')
            .next()
            .filter(|prefix| prefix.len() == 3)
            .unwrap_or(self.platform.collection())
    }
}

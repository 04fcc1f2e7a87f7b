use chrono::{Duration, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::domain::{Platform, TileId};
use crate::error::FlowError;
use crate::geometry::GeoBox;

pub const DEFAULT_MAX_ROWS: usize = 10;
pub const DEFAULT_LOOKBACK_DAYS: i64 = 30;

/// Inclusive sensing-date interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, FlowError> {
        if start > end {
            return Err(FlowError::InvalidFilter(format!(
                "date range {start} is after {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        self.start <= date && date <= self.end
    }

    /// RFC 3339 interval as used by STAC item search.
    pub fn to_interval(&self) -> String {
        format!(
            "{}T00:00:00Z/{}T23:59:59Z",
            self.start.format("%Y-%m-%d"),
            self.end.format("%Y-%m-%d")
        )
    }

    /// Parses `START,END`, `START,` or `START` (open to `today`) and `,END`.
    pub fn parse(value: &str, today: NaiveDate) -> Result<Self, FlowError> {
        let trimmed = value.trim();
        let (start, end) = match trimmed.split_once(',') {
            Some((start, end)) => (start.trim(), end.trim()),
            None => (trimmed, ""),
        };
        let end = if end.is_empty() {
            today
        } else {
            parse_date(end)?
        };
        let start = if start.is_empty() {
            end - Duration::days(DEFAULT_LOOKBACK_DAYS)
        } else {
            parse_date(start)?
        };
        Self::new(start, end)
    }

    pub fn last_days(today: NaiveDate, days: i64) -> Self {
        Self {
            start: today - Duration::days(days),
            end: today,
        }
    }
}

fn parse_date(value: &str) -> Result<NaiveDate, FlowError> {
    NaiveDate::parse_from_str(value, "%Y%m%d")
        .or_else(|_| NaiveDate::parse_from_str(value, "%Y-%m-%d"))
        .map_err(|_| FlowError::InvalidFilter(format!("unparsable date {value:?}")))
}

/// Normalized catalog query.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub footprint: GeoBox,
    pub dates: DateRange,
    /// Fraction in `[0, 1]`.
    pub cloud_ceiling: f64,
    pub tiles: Vec<TileId>,
    pub max_rows: usize,
    pub platform: Platform,
}

impl Query {
    pub fn allows_tile(&self, tile: Option<&TileId>) -> bool {
        if self.tiles.is_empty() {
            return true;
        }
        tile.map(|tile| self.tiles.contains(tile)).unwrap_or(false)
    }
}

/// Collects raw filter strings and validates them into a [`Query`].
#[derive(Debug, Clone)]
pub struct QueryBuilder {
    today: NaiveDate,
    footprint: GeoBox,
    dates: Option<String>,
    cloud_cover: Option<String>,
    tiles: Option<String>,
    max_rows: usize,
    platform: Platform,
}

impl QueryBuilder {
    pub fn new(footprint: GeoBox, today: NaiveDate) -> Self {
        Self {
            today,
            footprint,
            dates: None,
            cloud_cover: None,
            tiles: None,
            max_rows: DEFAULT_MAX_ROWS,
            platform: Platform::Sentinel2,
        }
    }

    pub fn dates(mut self, value: Option<&str>) -> Self {
        self.dates = value.map(str::to_string);
        self
    }

    pub fn cloud_cover(mut self, percent: Option<&str>) -> Self {
        self.cloud_cover = percent.map(str::to_string);
        self
    }

    pub fn tiles(mut self, value: Option<&str>) -> Self {
        self.tiles = value.map(str::to_string);
        self
    }

    pub fn max_rows(mut self, rows: usize) -> Self {
        self.max_rows = rows;
        self
    }

    pub fn platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }

    pub fn build(self) -> Result<Query, FlowError> {
        let dates = match self.dates.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => DateRange::parse(value, self.today)?,
            _ => DateRange::last_days(self.today, DEFAULT_LOOKBACK_DAYS),
        };

        let cloud_ceiling = match self.cloud_cover.as_deref().map(str::trim) {
            Some(value) if !value.is_empty() => parse_cloud_percent(value)?,
            _ => 1.0,
        };

        let tiles = self
            .tiles
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(str::parse::<TileId>)
            .collect::<Result<Vec<_>, _>>()?;

        if self.max_rows == 0 {
            return Err(FlowError::InvalidFilter(
                "max rows must be positive".to_string(),
            ));
        }

        Ok(Query {
            footprint: self.footprint,
            dates,
            cloud_ceiling,
            tiles,
            max_rows: self.max_rows,
            platform: self.platform,
        })
    }
}

fn parse_cloud_percent(value: &str) -> Result<f64, FlowError> {
    let percent: f64 = value
        .trim_end_matches('%')
        .parse()
        .map_err(|_| FlowError::InvalidFilter(format!("cloud cover {value:?} is not a number")))?;
    if !(0.0..=100.0).contains(&percent) {
        return Err(FlowError::InvalidFilter(format!(
            "cloud cover {percent} outside 0-100"
        )));
    }
    Ok(percent / 100.0)
}

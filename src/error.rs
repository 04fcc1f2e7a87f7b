use std::path::PathBuf;

use miette::Diagnostic;
use thiserror::Error;

#[derive(Debug, Clone, Error, Diagnostic)]
pub enum FlowError {
    #[error("invalid geometry: {0}")]
    #[diagnostic(help("intersect is LAT,LON or W,E,S,N; extent is W,S,E,N in UTM metres"))]
    InvalidGeometry(String),

    #[error("invalid filter: {0}")]
    #[diagnostic(help("dates are YYYYMMDD[,YYYYMMDD]; cloud cover is a percentage 0-100"))]
    InvalidFilter(String),

    #[error("invalid sigma parameters: {0}")]
    #[diagnostic(help("sigma is SLOPE,MIDPOINT where MIDPOINT is a raw value or a percentage"))]
    InvalidSigma(String),

    #[error("invalid product identifier: {0}")]
    InvalidProductId(String),

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error("catalog returned status {status}: {message}")]
    CatalogStatus { status: u16, message: String },

    #[error("catalog transport failed: {0}")]
    Transport(String),

    #[error("download of {id} failed: {reason}")]
    DownloadFailed { id: String, reason: String },

    #[error("integrity check failed for {id}: {reason}")]
    IntegrityError { id: String, reason: String },

    #[error("product not cached locally: {0}")]
    #[diagnostic(help("run once without --offline to fetch the archive"))]
    ProductNotCached(String),

    #[error("insufficient coverage for region {region}: best null fraction {best_null_fraction:.3}")]
    InsufficientCoverage {
        region: String,
        best_null_fraction: f64,
    },

    #[error("band {band} not found in archive {archive}")]
    MissingBand { band: String, archive: PathBuf },

    #[error("raster error: {0}")]
    Raster(String),

    #[error("missing config file at {0}")]
    MissingConfig(PathBuf),

    #[error("failed to read config file at {0}")]
    ConfigRead(PathBuf),

    #[error("failed to parse JSON config: {0}")]
    ConfigParse(String),

    #[error("filesystem error: {0}")]
    Filesystem(String),

    #[error("interrupted by user")]
    Interrupted,
}

impl FlowError {
    /// Errors that only cost the current region; the run moves on to the next one.
    pub fn is_region_recoverable(&self) -> bool {
        matches!(
            self,
            FlowError::CatalogUnavailable(_)
                | FlowError::DownloadFailed { .. }
                | FlowError::IntegrityError { .. }
                | FlowError::ProductNotCached(_)
                | FlowError::InsufficientCoverage { .. }
                | FlowError::MissingBand { .. }
                | FlowError::Raster(_)
        )
    }

    /// Errors that stop the whole run: bad configuration and interruption.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            FlowError::InvalidGeometry(_)
                | FlowError::InvalidFilter(_)
                | FlowError::InvalidSigma(_)
                | FlowError::InvalidProductId(_)
                | FlowError::MissingConfig(_)
                | FlowError::ConfigRead(_)
                | FlowError::ConfigParse(_)
                | FlowError::Interrupted
        )
    }

    /// Transport-level failures worth another attempt.
    pub fn is_transient(&self) -> bool {
        match self {
            FlowError::Transport(_) => true,
            FlowError::CatalogStatus { status, .. } => is_retryable_status(*status),
            _ => false,
        }
    }
}

pub fn is_retryable_status(status: u16) -> bool {
    status == 429 || (500..600).contains(&status)
}

impl From<tiff::TiffError> for FlowError {
    fn from(err: tiff::TiffError) -> Self {
        FlowError::Raster(err.to_string())
    }
}

impl From<zip::result::ZipError> for FlowError {
    fn from(err: zip::result::ZipError) -> Self {
        FlowError::Raster(format!("archive: {err}"))
    }
}

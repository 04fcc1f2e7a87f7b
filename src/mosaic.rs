//! Per-pass mosaicking and pass selection.

use std::collections::BTreeMap;

use std::fs;

use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::compose::Tile;
use crate::domain::{BandSet, ProductId};
use crate::error::FlowError;
use crate::geometry::{Grid, UtmExtent};
use crate::query::DateRange;
use crate::raster::write_rgb_geotiff;
use crate::store::Store;

/// Stitched output for one region and one sensing pass.
#[derive(Debug, Clone)]
pub struct Composite {
    pub region: String,
    pub grid: Grid,
    pub bands: BandSet,
    pub date: NaiveDate,
    pub unit: String,
    pub products: Vec<ProductId>,
    /// Mean cloud cover of contributing products; `None` for radar.
    pub cloud_cover: Option<f64>,
    pub null_fraction: f64,
    pub channels: [Vec<u8>; 3],
    pub valid: Vec<bool>,
}

/// JSON written next to each composite image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositeSidecar {
    pub region: String,
    pub date: NaiveDate,
    /// Searched date range that produced this composite.
    pub dates: DateRange,
    pub unit: String,
    pub bands: BandSet,
    pub epsg: u32,
    pub extent: UtmExtent,
    pub resolution: f64,
    pub products: Vec<ProductId>,
    pub cloud_cover: Option<f64>,
    pub null_fraction: f64,
}

impl CompositeSidecar {
    pub fn load(path: &Utf8Path) -> Result<Self, FlowError> {
        let bytes = fs::read(path.as_std_path())
            .map_err(|err| FlowError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_slice(&bytes)
            .map_err(|err| FlowError::Filesystem(format!("{path}: {err}")))
    }

    /// True when this composite was built for the same grid, bands and date range.
    pub fn matches(&self, grid: &Grid, bands: BandSet, dates: &DateRange) -> bool {
        let extent = grid.extent();
        let close = |a: f64, b: f64| (a - b).abs() < 1e-6;
        self.bands == bands
            && self.dates == *dates
            && self.epsg == grid.zone.epsg()
            && close(self.resolution, grid.resolution)
            && close(self.extent.west, extent.west)
            && close(self.extent.south, extent.south)
            && close(self.extent.east, extent.east)
            && close(self.extent.north, extent.north)
    }
}

/// Composites on disk for `region` whose sidecar matches the grid, bands and date range.
pub fn reusable_composites(
    store: &Store,
    region: &str,
    grid: &Grid,
    bands: BandSet,
    dates: &DateRange,
) -> Vec<Utf8PathBuf> {
    store
        .existing_composites(region, bands)
        .into_iter()
        .filter(|path| match CompositeSidecar::load(&path.with_extension("json")) {
            Ok(sidecar) => sidecar.matches(grid, bands, dates),
            Err(err) => {
                debug!("not reusing {path}: {err}");
                false
            }
        })
        .collect()
}

impl Composite {
    pub fn sidecar(&self, dates: DateRange) -> CompositeSidecar {
        CompositeSidecar {
            region: self.region.clone(),
            date: self.date,
            dates,
            unit: self.unit.clone(),
            bands: self.bands,
            epsg: self.grid.zone.epsg(),
            extent: self.grid.extent(),
            resolution: self.grid.resolution,
            products: self.products.clone(),
            cloud_cover: self.cloud_cover,
            null_fraction: self.null_fraction,
        }
    }

    /// Writes `composite/{region}/{date}_{bands}.tif` and its `.json` sidecar,
    /// recording the searched `dates`.
    pub fn write(&self, store: &Store, dates: DateRange) -> Result<Utf8PathBuf, FlowError> {
        let path = store.composite_path(&self.region, self.date, self.bands);
        Store::write_file_atomic(&path, |file| {
            write_rgb_geotiff(file, &self.grid, &self.channels, &self.valid)
        })?;
        Store::write_json_atomic(&path.with_extension("json"), &self.sidecar(dates))?;
        info!(
            "wrote {path} ({} products, null fraction {:.3})",
            self.products.len(),
            self.null_fraction
        );
        Ok(path)
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MosaicBuilder {
    ceiling: f64,
}

impl MosaicBuilder {
    /// A pass qualifies when its null fraction is strictly below `ceiling`.
    pub fn new(ceiling: f64) -> Self {
        Self { ceiling }
    }

    /// The qualifying pass with the lowest mean cloud cover; ties go to the most recent.
    pub fn build(&self, region: &str, grid: &Grid, tiles: &[Tile]) -> Result<Composite, FlowError> {
        let mut passes = self.build_all(region, grid, tiles)?;
        passes.sort_by(|a, b| {
            let a_cloud = a.cloud_cover.unwrap_or(0.0);
            let b_cloud = b.cloud_cover.unwrap_or(0.0);
            a_cloud
                .total_cmp(&b_cloud)
                .then_with(|| b.date.cmp(&a.date))
                .then_with(|| a.unit.cmp(&b.unit))
        });
        let best = passes.remove(0);
        info!(
            "selected pass {} {} for {region} (cloud {:.3})",
            best.date,
            best.unit,
            best.cloud_cover.unwrap_or(0.0)
        );
        Ok(best)
    }

    /// Every qualifying pass, newest first. `InsufficientCoverage` when none qualifies.
    pub fn build_all(
        &self,
        region: &str,
        grid: &Grid,
        tiles: &[Tile],
    ) -> Result<Vec<Composite>, FlowError> {
        let mut groups: BTreeMap<(NaiveDate, String), Vec<&Tile>> = BTreeMap::new();
        for tile in tiles {
            if !tile.usable {
                debug!("dropping unusable tile {}", tile.product.id);
                continue;
            }
            if tile.grid != *grid {
                return Err(FlowError::Raster(format!(
                    "tile {} is not on the region grid",
                    tile.product.id
                )));
            }
            groups
                .entry((tile.product.sensing_date(), tile.product.unit().to_string()))
                .or_default()
                .push(tile);
        }

        let mut best_null_fraction = 1.0f64;
        let mut qualifying = Vec::new();
        for ((date, unit), pass_tiles) in groups.into_iter().rev() {
            let composite = paint(region, grid, date, unit, pass_tiles);
            best_null_fraction = best_null_fraction.min(composite.null_fraction);
            if composite.null_fraction < self.ceiling {
                qualifying.push(composite);
            } else {
                debug!(
                    "pass {} {} rejected: null fraction {:.3}",
                    composite.date, composite.unit, composite.null_fraction
                );
            }
        }

        if qualifying.is_empty() {
            return Err(FlowError::InsufficientCoverage {
                region: region.to_string(),
                best_null_fraction,
            });
        }
        Ok(qualifying)
    }
}

/// Painter's algorithm: cloudiest first, so the clearest tile paints last.
fn paint(
    region: &str,
    grid: &Grid,
    date: NaiveDate,
    unit: String,
    mut tiles: Vec<&Tile>,
) -> Composite {
    tiles.sort_by(|a, b| {
        b.product
            .cloud_cover_or_zero()
            .total_cmp(&a.product.cloud_cover_or_zero())
            .then_with(|| b.product.id.cmp(&a.product.id))
    });

    let len = grid.len();
    let mut channels = [vec![0u8; len], vec![0u8; len], vec![0u8; len]];
    let mut valid = vec![false; len];
    for tile in &tiles {
        for idx in 0..len {
            if tile.valid[idx] {
                for (out, src) in channels.iter_mut().zip(&tile.channels) {
                    out[idx] = src[idx];
                }
                valid[idx] = true;
            }
        }
    }

    let nulls = valid.iter().filter(|valid| !**valid).count();
    let null_fraction = if len == 0 {
        1.0
    } else {
        nulls as f64 / len as f64
    };
    let covers: Vec<f64> = tiles
        .iter()
        .filter_map(|tile| tile.product.cloud_cover)
        .collect();
    let cloud_cover =
        (!covers.is_empty()).then(|| covers.iter().sum::<f64>() / covers.len() as f64);
    let mut products: Vec<ProductId> = tiles.iter().map(|tile| tile.product.id.clone()).collect();
    products.sort();

    Composite {
        region: region.to_string(),
        grid: *grid,
        bands: tiles.first().map(|tile| tile.bands).unwrap_or(BandSet::Rgb),
        date,
        unit,
        products,
        cloud_cover,
        null_fraction,
        channels,
        valid,
    }
}

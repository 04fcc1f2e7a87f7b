use std::sync::LazyLock;

use camino::Utf8Path;
use rayon::prelude::*;
use regex::Regex;
use tracing::debug;

use crate::domain::{BandSet, Product, Resampling};
use crate::error::FlowError;
use crate::fs_util::{list_entries, read_entry};
use crate::geometry::{Grid, utm_to_wgs84, wgs84_to_utm};
use crate::raster::{BandRaster, write_rgb_geotiff};
use crate::store::Store;
use crate::stretch::SigmoidalStretch;

static BAND_FILE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)\.tiff?$").unwrap());

/// One product resampled onto an output grid, stretched to 8 bits.
#[derive(Debug, Clone)]
pub struct Tile {
    pub product: Product,
    pub grid: Grid,
    pub bands: BandSet,
    pub channels: [Vec<u8>; 3],
    pub valid: Vec<bool>,
    /// Grid pixels that fall inside the product raster.
    inside: Vec<bool>,
    /// Null pixels over inside pixels; 1.0 when nothing overlaps.
    pub null_fraction: f64,
    /// Inside pixels over all grid pixels.
    pub coverage: f64,
    pub usable: bool,
    ceiling: f64,
}

impl Tile {
    pub fn new(
        product: Product,
        grid: Grid,
        bands: BandSet,
        channels: [Vec<u8>; 3],
        valid: Vec<bool>,
        inside: Vec<bool>,
        ceiling: f64,
    ) -> Self {
        let overlap = inside.iter().filter(|inside| **inside).count();
        let nulls = inside
            .iter()
            .zip(&valid)
            .filter(|(inside, valid)| **inside && !**valid)
            .count();
        let null_fraction = if overlap == 0 {
            1.0
        } else {
            nulls as f64 / overlap as f64
        };
        let coverage = if grid.is_empty() {
            0.0
        } else {
            overlap as f64 / grid.len() as f64
        };
        Self {
            product,
            grid,
            bands,
            channels,
            valid,
            inside,
            null_fraction,
            coverage,
            usable: overlap > 0 && null_fraction <= ceiling,
            ceiling,
        }
    }

    pub fn overlap(&self) -> usize {
        self.inside.iter().filter(|inside| **inside).count()
    }

    /// Re-crops onto `sub`, which must lie on this tile's pixel lattice.
    pub fn crop(&self, sub: &Grid) -> Result<Tile, FlowError> {
        let (col0, row0) = self.grid.offset_of(sub).ok_or_else(|| {
            FlowError::InvalidGeometry(format!(
                "grid {}x{} at ({}, {}) is not aligned within the tile grid",
                sub.width, sub.height, sub.west, sub.north
            ))
        })?;
        let pick = |values: &[u8]| -> Vec<u8> {
            (0..sub.height)
                .flat_map(|row| {
                    let start = (row0 + row) * self.grid.width + col0;
                    values[start..start + sub.width].iter().copied()
                })
                .collect()
        };
        let pick_mask = |values: &[bool]| -> Vec<bool> {
            (0..sub.height)
                .flat_map(|row| {
                    let start = (row0 + row) * self.grid.width + col0;
                    values[start..start + sub.width].iter().copied()
                })
                .collect()
        };
        Ok(Tile::new(
            self.product.clone(),
            *sub,
            self.bands,
            [
                pick(&self.channels[0]),
                pick(&self.channels[1]),
                pick(&self.channels[2]),
            ],
            pick_mask(&self.valid),
            pick_mask(&self.inside),
            self.ceiling,
        ))
    }

    pub fn write(&self, path: &Utf8Path) -> Result<(), FlowError> {
        Store::write_file_atomic(path, |file| {
            write_rgb_geotiff(file, &self.grid, &self.channels, &self.valid)
        })
    }
}

/// Turns product archives into stretched tiles on the output grid.
#[derive(Debug, Clone, Copy)]
pub struct TileCompositor {
    stretch: SigmoidalStretch,
    resampling: Resampling,
    ceiling: f64,
}

impl TileCompositor {
    /// `ceiling` is the largest null fraction a usable tile may have.
    pub fn new(stretch: SigmoidalStretch, resampling: Resampling, ceiling: f64) -> Self {
        Self {
            stretch,
            resampling,
            ceiling,
        }
    }

    pub fn compose(
        &self,
        archive: &Utf8Path,
        product: &Product,
        bands: BandSet,
        grid: &Grid,
    ) -> Result<Tile, FlowError> {
        let entries = list_entries(archive.as_std_path())?;
        let rasters = bands
            .bands()
            .iter()
            .map(|band| {
                let name = find_band_entry(&entries, band).ok_or_else(|| FlowError::MissingBand {
                    band: band.to_string(),
                    archive: archive.as_std_path().to_path_buf(),
                })?;
                debug!("decoding {name} from {}", product.id);
                BandRaster::from_geotiff_bytes(&read_entry(archive.as_std_path(), name)?)
            })
            .collect::<Result<Vec<_>, FlowError>>()?;

        let samples: Vec<(bool, [Option<f32>; 3])> = (0..grid.len())
            .into_par_iter()
            .map(|idx| {
                let (x, y) = grid.pixel_center(idx % grid.width, idx / grid.width);
                let mut values = [None; 3];
                let mut inside = false;
                for (channel, raster) in rasters.iter().enumerate() {
                    let (bx, by) = if raster.georef.zone == grid.zone {
                        (x, y)
                    } else {
                        let (lon, lat) = utm_to_wgs84(x, y, grid.zone);
                        wgs84_to_utm(lon, lat, raster.georef.zone)
                    };
                    if channel == 0 {
                        inside = raster.contains(bx, by);
                    }
                    values[channel] = raster.sample(bx, by, self.resampling);
                }
                (inside, values)
            })
            .collect();

        let mut channels = [
            Vec::with_capacity(grid.len()),
            Vec::with_capacity(grid.len()),
            Vec::with_capacity(grid.len()),
        ];
        let mut valid = Vec::with_capacity(grid.len());
        let mut inside = Vec::with_capacity(grid.len());
        for (is_inside, values) in samples {
            let is_valid = values.iter().all(Option::is_some);
            for (channel, value) in channels.iter_mut().zip(values) {
                channel.push(match value {
                    Some(raw) if is_valid => self.stretch.apply(raw as f64),
                    _ => 0,
                });
            }
            valid.push(is_valid);
            inside.push(is_inside);
        }

        let tile = Tile::new(
            product.clone(),
            *grid,
            bands,
            channels,
            valid,
            inside,
            self.ceiling,
        );
        debug!(
            "{}: coverage {:.3}, null fraction {:.3}, usable {}",
            product.id, tile.coverage, tile.null_fraction, tile.usable
        );
        Ok(tile)
    }
}

/// Archive member holding `band`, e.g. `T32TMS_20200715T102031_B04.tif`,
/// `..._B04_10m.tif` or `s1a-iw-grd-vv-....tiff`. Lexicographically first wins.
pub fn find_band_entry<'a>(entries: &'a [String], band: &str) -> Option<&'a str> {
    let band = band.to_ascii_lowercase();
    let mut matches: Vec<&str> = entries
        .iter()
        .map(String::as_str)
        .filter(|name| BAND_FILE_RE.is_match(name))
        .filter(|name| {
            let file = name.rsplit('/').next().unwrap_or_default().to_ascii_lowercase();
            let stem = BAND_FILE_RE.replace(&file, "");
            stem.split(['_', '-', '.']).any(|token| token == band)
        })
        .collect();
    matches.sort_unstable();
    matches.first().copied()
}

mod common;

use std::fs;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use sentinelflow::compose::TileCompositor;
use sentinelflow::domain::{BandSet, Product, Resampling};
use sentinelflow::error::FlowError;
use sentinelflow::geometry::{Grid, UtmExtent};
use sentinelflow::stretch::{DEFAULT_INPUT_MAX, SigmaParams, SigmoidalStretch};

use common::{WEST, archive, band_tiff, product, rgb_archive, temp_store, zone32n};

const ID: &str = "S2A_MSIL1C_20200715T102031_N0209_R065_T32TMS_20200715T123456";

fn grid(extent: &str) -> Grid {
    let extent: UtmExtent = extent.parse().unwrap();
    Grid::covering(zone32n(), &extent, 10.0).unwrap()
}

fn full_grid() -> Grid {
    grid("420000,5140000,421000,5141000")
}

fn compositor(resampling: Resampling) -> TileCompositor {
    let stretch = SigmoidalStretch::new(SigmaParams::default(), DEFAULT_INPUT_MAX).unwrap();
    TileCompositor::new(stretch, resampling, 0.5)
}

/// 100x100 raster over the full grid; the east 40 columns are nodata.
fn west_valid_archive() -> (tempfile::TempDir, camino::Utf8PathBuf, Product) {
    let data: Vec<u16> = (0..100 * 100)
        .map(|idx| {
            let (col, row) = (idx % 100, idx / 100);
            if col < 60 { 1000 + (col * 50 + row * 7) as u16 } else { 0 }
        })
        .collect();
    let bytes = rgb_archive(WEST, 100, 100, &data);
    let (dir, store) = temp_store();
    let path = store.archives_dir().join(format!("{ID}.zip"));
    fs::write(path.as_std_path(), &bytes).unwrap();
    let product = product(ID, NaiveDate::from_ymd_opt(2020, 7, 15).unwrap(), 0.05, &bytes);
    (dir, path, product)
}

#[test]
fn crop_matches_direct_composition() {
    let (_dir, archive, product) = west_valid_archive();
    let sub = grid("420100,5140200,420500,5140800");

    for resampling in [Resampling::Nearest, Resampling::Bilinear] {
        let compositor = compositor(resampling);
        let full = compositor
            .compose(&archive, &product, BandSet::Rgb, &full_grid())
            .unwrap();
        let cropped = full.crop(&sub).unwrap();
        let direct = compositor
            .compose(&archive, &product, BandSet::Rgb, &sub)
            .unwrap();

        assert_eq!(cropped.grid, direct.grid);
        assert_eq!(cropped.valid, direct.valid);
        assert_eq!(cropped.channels, direct.channels);
        assert_eq!(cropped.null_fraction, direct.null_fraction);
    }
}

#[test]
fn shrinking_to_valid_region_lowers_null_fraction() {
    let (_dir, archive, product) = west_valid_archive();
    let compositor = compositor(Resampling::Nearest);
    let full = compositor
        .compose(&archive, &product, BandSet::Rgb, &full_grid())
        .unwrap();
    let sub = full.crop(&grid("420000,5140000,420500,5141000")).unwrap();

    assert!((full.null_fraction - 0.4).abs() < 1e-9);
    assert_eq!(full.coverage, 1.0);
    assert!(full.usable);
    assert_eq!(sub.null_fraction, 0.0);
    assert!(sub.null_fraction <= full.null_fraction);
}

#[test]
fn tile_outside_extent_is_unusable() {
    let (_dir, archive, product) = west_valid_archive();
    let far = grid("430000,5140000,430100,5140100");
    let tile = compositor(Resampling::Nearest)
        .compose(&archive, &product, BandSet::Rgb, &far)
        .unwrap();
    assert_eq!(tile.overlap(), 0);
    assert_eq!(tile.coverage, 0.0);
    assert!(!tile.usable);
}

#[test]
fn partial_overlap_rates_nulls_over_overlap_only() {
    // Raster covers the west 30 columns of the grid, all valid.
    let bytes = rgb_archive(WEST, 30, 100, &[2000u16; 3000]);
    let (_dir, store) = temp_store();
    let path = store.archives_dir().join("partial.zip");
    fs::write(path.as_std_path(), &bytes).unwrap();
    let product = product(ID, NaiveDate::from_ymd_opt(2020, 7, 15).unwrap(), 0.05, &bytes);

    let tile = compositor(Resampling::Nearest)
        .compose(&path, &product, BandSet::Rgb, &full_grid())
        .unwrap();
    assert!((tile.coverage - 0.3).abs() < 1e-9);
    assert_eq!(tile.null_fraction, 0.0);
    assert!(tile.usable);
}

#[test]
fn missing_band_is_reported() {
    let band = band_tiff(WEST, common::NORTH, 2, 2, &[1, 2, 3, 4]);
    let bytes = archive(&[("T32TMS_B04.tif", band)]);
    let (_dir, store) = temp_store();
    let path = store.archives_dir().join("missing.zip");
    fs::write(path.as_std_path(), &bytes).unwrap();
    let product = product(ID, NaiveDate::from_ymd_opt(2020, 7, 15).unwrap(), 0.05, &bytes);

    let err = compositor(Resampling::Nearest)
        .compose(&path, &product, BandSet::Rgb, &full_grid())
        .unwrap_err();
    assert_matches!(err, FlowError::MissingBand { band, .. } if band == "B03");
}

#[test]
fn misaligned_crop_is_rejected() {
    let (_dir, archive, product) = west_valid_archive();
    let full = compositor(Resampling::Nearest)
        .compose(&archive, &product, BandSet::Rgb, &full_grid())
        .unwrap();
    assert_matches!(
        full.crop(&grid("420005,5140000,420505,5141000")),
        Err(FlowError::InvalidGeometry(_))
    );
}

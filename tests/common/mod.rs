#![allow(dead_code)]

use std::collections::HashMap;
use std::io::{Cursor, Write};
use std::sync::Mutex;

use camino::Utf8PathBuf;
use chrono::{NaiveDate, TimeZone, Utc};
use sha2::{Digest, Sha256};
use tiff::encoder::TiffEncoder;
use tiff::encoder::colortype::Gray16;
use zip::write::SimpleFileOptions;

use sentinelflow::catalog::{ArchiveStream, CatalogClient, apply_filters};
use sentinelflow::domain::{Platform, Product, ProductId};
use sentinelflow::error::FlowError;
use sentinelflow::geometry::{GeoBox, UtmZone};
use sentinelflow::query::Query;
use sentinelflow::raster::{GeoRef, write_georef_tags};
use sentinelflow::store::Store;

pub const WEST: f64 = 420_000.0;
pub const NORTH: f64 = 5_141_000.0;

pub fn zone32n() -> UtmZone {
    UtmZone::from_epsg(32632).unwrap()
}

pub fn temp_store() -> (tempfile::TempDir, Store) {
    let dir = tempfile::tempdir().unwrap();
    let workdir = Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let store = Store::open(workdir).unwrap();
    (dir, store)
}

/// Single-band u16 GeoTIFF at 10 m in zone 32N.
pub fn band_tiff(west: f64, north: f64, width: u32, height: u32, data: &[u16]) -> Vec<u8> {
    let georef = GeoRef {
        zone: zone32n(),
        west,
        north,
        res_x: 10.0,
        res_y: 10.0,
    };
    let mut cursor = Cursor::new(Vec::new());
    let mut encoder = TiffEncoder::new(&mut cursor).unwrap();
    let mut image = encoder.new_image::<Gray16>(width, height).unwrap();
    write_georef_tags(image.encoder(), &georef, "0").unwrap();
    image.write_data(data).unwrap();
    cursor.into_inner()
}

/// Zip with one band raster per name, e.g. `GRANULE/IMG_DATA/T32TMS_B04.tif`.
pub fn archive(members: &[(&str, Vec<u8>)]) -> Vec<u8> {
    let mut cursor = Cursor::new(Vec::new());
    {
        let mut writer = zip::ZipWriter::new(&mut cursor);
        for (name, bytes) in members {
            writer
                .start_file(name.to_string(), SimpleFileOptions::default())
                .unwrap();
            writer.write_all(bytes).unwrap();
        }
        writer.finish().unwrap();
    }
    cursor.into_inner()
}

/// RGB archive whose three bands share `data`.
pub fn rgb_archive(west: f64, width: u32, height: u32, data: &[u16]) -> Vec<u8> {
    let band = band_tiff(west, NORTH, width, height, data);
    archive(&[
        ("GRANULE/IMG_DATA/T32TMS_B04.tif", band.clone()),
        ("GRANULE/IMG_DATA/T32TMS_B03.tif", band.clone()),
        ("GRANULE/IMG_DATA/T32TMS_B02.tif", band),
    ])
}

pub fn product(id: &str, date: NaiveDate, cloud: f64, bytes: &[u8]) -> Product {
    let id: ProductId = id.parse().unwrap();
    Product {
        tile: id.embedded_tile(),
        id,
        platform: Platform::Sentinel2,
        sensed_at: Utc.from_utc_datetime(&date.and_hms_opt(10, 20, 31).unwrap()),
        footprint: GeoBox::new(7.5, 45.9, 9.0, 46.9).unwrap(),
        cloud_cover: Some(cloud),
        bands: vec!["B02".to_string(), "B03".to_string(), "B04".to_string()],
        url: "https://catalog.invalid/archive.zip".to_string(),
        size: Some(bytes.len() as u64),
        checksum: Some(hex::encode(Sha256::digest(bytes))),
    }
}

/// In-memory catalog counting calls.
#[derive(Default)]
pub struct MockCatalog {
    pub products: Vec<Product>,
    pub archives: HashMap<ProductId, Vec<u8>>,
    pub searches: Mutex<usize>,
    pub downloads: Mutex<usize>,
    pub offsets: Mutex<Vec<u64>>,
    /// Served instead of the real bytes this many times.
    pub corrupt_first: Mutex<usize>,
    pub honour_range: bool,
}

impl MockCatalog {
    pub fn new(entries: Vec<(Product, Vec<u8>)>) -> Self {
        let mut catalog = Self {
            honour_range: true,
            ..Self::default()
        };
        for (product, bytes) in entries {
            catalog.archives.insert(product.id.clone(), bytes);
            catalog.products.push(product);
        }
        catalog
    }

    pub fn download_count(&self) -> usize {
        *self.downloads.lock().unwrap()
    }
}

impl CatalogClient for MockCatalog {
    fn search(&self, query: &Query) -> Result<Vec<Product>, FlowError> {
        *self.searches.lock().unwrap() += 1;
        let matching = self
            .products
            .iter()
            .filter(|product| product.footprint.intersects(&query.footprint))
            .cloned()
            .collect();
        Ok(apply_filters(matching, query))
    }

    fn download(&self, product: &Product, offset: u64) -> Result<ArchiveStream, FlowError> {
        *self.downloads.lock().unwrap() += 1;
        self.offsets.lock().unwrap().push(offset);
        let bytes = self
            .archives
            .get(&product.id)
            .cloned()
            .ok_or_else(|| FlowError::CatalogStatus {
                status: 404,
                message: "unknown product".to_string(),
            })?;
        {
            let mut corrupt = self.corrupt_first.lock().unwrap();
            if *corrupt > 0 {
                *corrupt -= 1;
                let mut garbage = bytes.clone();
                garbage.iter_mut().for_each(|byte| *byte = !*byte);
                return Ok(ArchiveStream {
                    reader: Box::new(Cursor::new(garbage)),
                    resumed: false,
                });
            }
        }
        if offset > 0 && self.honour_range {
            if offset >= bytes.len() as u64 {
                return Err(FlowError::CatalogStatus {
                    status: 416,
                    message: "Range Not Satisfiable".to_string(),
                });
            }
            return Ok(ArchiveStream {
                reader: Box::new(Cursor::new(bytes[offset as usize..].to_vec())),
                resumed: true,
            });
        }
        Ok(ArchiveStream {
            reader: Box::new(Cursor::new(bytes)),
            resumed: false,
        })
    }
}

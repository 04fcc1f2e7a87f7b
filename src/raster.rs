//! Single-band GeoTIFF decoding and RGB GeoTIFF encoding.

use std::io::{Cursor, Seek, Write};

use tiff::decoder::{Decoder, DecodingResult, Limits};
use tiff::encoder::colortype::RGB8;
use tiff::encoder::compression::{Deflate, DeflateLevel};
use tiff::encoder::{DirectoryEncoder, TiffEncoder, TiffKind};
use tiff::tags::Tag;

use crate::domain::Resampling;
use crate::error::FlowError;
use crate::geometry::{Grid, UtmZone};

const GT_MODEL_TYPE_GEO_KEY: u16 = 1024;
const GT_RASTER_TYPE_GEO_KEY: u16 = 1025;
const PROJECTED_CS_TYPE_GEO_KEY: u16 = 3072;
const MODEL_TYPE_PROJECTED: u16 = 1;
const RASTER_PIXEL_IS_AREA: u16 = 1;

/// Samples at or above this are saturated and treated as invalid.
pub const SATURATED: f32 = 65_535.0;

/// Georeferencing of a north-up raster in a UTM zone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GeoRef {
    pub zone: UtmZone,
    pub west: f64,
    pub north: f64,
    pub res_x: f64,
    pub res_y: f64,
}

impl From<&Grid> for GeoRef {
    fn from(grid: &Grid) -> Self {
        Self {
            zone: grid.zone,
            west: grid.west,
            north: grid.north,
            res_x: grid.resolution,
            res_y: grid.resolution,
        }
    }
}

/// One decoded spectral band.
#[derive(Debug)]
pub struct BandRaster {
    pub georef: GeoRef,
    pub width: usize,
    pub height: usize,
    data: Vec<f32>,
    nodata: f32,
}

impl BandRaster {
    pub fn new(
        georef: GeoRef,
        width: usize,
        height: usize,
        data: Vec<f32>,
        nodata: f32,
    ) -> Result<Self, FlowError> {
        if data.len() != width * height {
            return Err(FlowError::Raster(format!(
                "expected {} samples for {width}x{height}, got {}",
                width * height,
                data.len()
            )));
        }
        Ok(Self {
            georef,
            width,
            height,
            data,
            nodata,
        })
    }

    /// Decodes a single-band GeoTIFF held in memory.
    pub fn from_geotiff_bytes(bytes: &[u8]) -> Result<Self, FlowError> {
        let mut decoder = Decoder::new(Cursor::new(bytes))?;

        // Full-resolution Sentinel-2 bands are 10980 x 10980 u16 samples.
        let mut limits = Limits::default();
        limits.decoding_buffer_size = 1024 * 1024 * 1024;
        limits.intermediate_buffer_size = 1024 * 1024 * 1024;
        limits.ifd_value_size = 64 * 1024 * 1024;
        decoder = decoder.with_limits(limits);

        let (width, height) = decoder.dimensions()?;
        let georef = read_georef(&mut decoder)?;
        let nodata = decoder
            .get_tag_ascii_string(Tag::GdalNodata)
            .ok()
            .and_then(|value| value.trim().trim_end_matches('\0').parse::<f32>().ok())
            .unwrap_or(0.0);
        let data = decode_samples(decoder.read_image()?);
        Self::new(georef, width as usize, height as usize, data, nodata)
    }

    fn value(&self, col: usize, row: usize) -> Option<f32> {
        let value = self.data[row * self.width + col];
        let invalid = value.is_nan() || value == self.nodata || value >= SATURATED;
        (!invalid).then_some(value)
    }

    /// True when projected (`x`, `y`) falls within the raster footprint.
    pub fn contains(&self, x: f64, y: f64) -> bool {
        let fx = (x - self.georef.west) / self.georef.res_x;
        let fy = (self.georef.north - y) / self.georef.res_y;
        fx >= 0.0 && fy >= 0.0 && fx < self.width as f64 && fy < self.height as f64
    }

    /// Sample at projected coordinates in this raster's own zone; `None` for null.
    pub fn sample(&self, x: f64, y: f64, resampling: Resampling) -> Option<f32> {
        if !self.contains(x, y) {
            return None;
        }
        let fx = (x - self.georef.west) / self.georef.res_x;
        let fy = (self.georef.north - y) / self.georef.res_y;
        match resampling {
            Resampling::Nearest => self.value(fx as usize, fy as usize),
            Resampling::Bilinear => {
                let cx = (fx - 0.5).max(0.0);
                let cy = (fy - 0.5).max(0.0);
                let x0 = (cx.floor() as usize).min(self.width - 1);
                let y0 = (cy.floor() as usize).min(self.height - 1);
                let x1 = (x0 + 1).min(self.width - 1);
                let y1 = (y0 + 1).min(self.height - 1);
                let tx = (cx - x0 as f64).clamp(0.0, 1.0);
                let ty = (cy - y0 as f64).clamp(0.0, 1.0);
                let v00 = self.value(x0, y0)? as f64;
                let v10 = self.value(x1, y0)? as f64;
                let v01 = self.value(x0, y1)? as f64;
                let v11 = self.value(x1, y1)? as f64;
                let value = v00 * (1.0 - tx) * (1.0 - ty)
                    + v10 * tx * (1.0 - ty)
                    + v01 * (1.0 - tx) * ty
                    + v11 * tx * ty;
                Some(value as f32)
            }
        }
    }
}

fn read_georef<R: std::io::Read + Seek>(decoder: &mut Decoder<R>) -> Result<GeoRef, FlowError> {
    let tiepoint = decoder
        .get_tag_f64_vec(Tag::ModelTiepointTag)
        .map_err(|_| FlowError::Raster("missing ModelTiepoint tag".to_string()))?;
    let scale = decoder
        .get_tag_f64_vec(Tag::ModelPixelScaleTag)
        .map_err(|_| FlowError::Raster("missing ModelPixelScale tag".to_string()))?;
    if tiepoint.len() < 6 || scale.len() < 2 {
        return Err(FlowError::Raster("malformed georeferencing tags".to_string()));
    }
    let keys = decoder
        .get_tag_u16_vec(Tag::GeoKeyDirectoryTag)
        .map_err(|_| FlowError::Raster("missing GeoKeyDirectory tag".to_string()))?;
    let epsg = geokey_value(&keys, PROJECTED_CS_TYPE_GEO_KEY)
        .ok_or_else(|| FlowError::Raster("raster is not in a projected CRS".to_string()))?;
    let zone = UtmZone::from_epsg(epsg as u32)
        .ok_or_else(|| FlowError::Raster(format!("EPSG:{epsg} is not a UTM zone")))?;

    // Tiepoint is [i, j, k, x, y, z]: pixel (i, j) sits at world (x, y).
    Ok(GeoRef {
        zone,
        west: tiepoint[3] - tiepoint[0] * scale[0],
        north: tiepoint[4] + tiepoint[1] * scale[1],
        res_x: scale[0],
        res_y: scale[1],
    })
}

fn geokey_value(keys: &[u16], wanted: u16) -> Option<u16> {
    let count = *keys.get(3)? as usize;
    keys.get(4..4 + count * 4)?
        .chunks_exact(4)
        .find(|entry| entry[0] == wanted && entry[1] == 0)
        .map(|entry| entry[3])
}

fn decode_samples(result: DecodingResult) -> Vec<f32> {
    match result {
        DecodingResult::U8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::U32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::U64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I8(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I16(data) => data.into_iter().map(f32::from).collect(),
        DecodingResult::I32(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::I64(data) => data.into_iter().map(|v| v as f32).collect(),
        DecodingResult::F32(data) => data,
        DecodingResult::F64(data) => data.into_iter().map(|v| v as f32).collect(),
    }
}

/// Writes ModelPixelScale, ModelTiepoint, the projected GeoKeyDirectory and the
/// GDAL nodata tag.
pub fn write_georef_tags<W: Write + Seek, K: TiffKind>(
    dir: &mut DirectoryEncoder<W, K>,
    georef: &GeoRef,
    nodata: &str,
) -> Result<(), FlowError> {
    let pixel_scale = [georef.res_x, georef.res_y, 0.0];
    dir.write_tag(Tag::ModelPixelScaleTag, pixel_scale.as_slice())?;
    let tiepoint = [0.0, 0.0, 0.0, georef.west, georef.north, 0.0];
    dir.write_tag(Tag::ModelTiepointTag, tiepoint.as_slice())?;
    let geokeys: [u16; 16] = [
        1,
        1,
        0,
        3,
        GT_MODEL_TYPE_GEO_KEY,
        0,
        1,
        MODEL_TYPE_PROJECTED,
        GT_RASTER_TYPE_GEO_KEY,
        0,
        1,
        RASTER_PIXEL_IS_AREA,
        PROJECTED_CS_TYPE_GEO_KEY,
        0,
        1,
        georef.zone.epsg() as u16,
    ];
    dir.write_tag(Tag::GeoKeyDirectoryTag, geokeys.as_slice())?;
    dir.write_tag(Tag::GdalNodata, nodata)?;
    Ok(())
}

/// Encodes three 8-bit channels as an interleaved RGB GeoTIFF. Null pixels are
/// written as 0 in every channel, matching the nodata tag.
pub fn write_rgb_geotiff<W: Write + Seek>(
    writer: W,
    grid: &Grid,
    channels: &[Vec<u8>; 3],
    valid: &[bool],
) -> Result<(), FlowError> {
    let len = grid.len();
    if channels.iter().any(|channel| channel.len() != len) || valid.len() != len {
        return Err(FlowError::Raster(
            "channel length does not match the output grid".to_string(),
        ));
    }
    let mut interleaved = Vec::with_capacity(len * 3);
    for idx in 0..len {
        for channel in channels {
            interleaved.push(if valid[idx] { channel[idx] } else { 0 });
        }
    }

    let mut encoder = TiffEncoder::new(writer)?;
    let mut image = encoder.new_image_with_compression::<RGB8, _>(
        grid.width as u32,
        grid.height as u32,
        Deflate::with_level(DeflateLevel::Balanced),
    )?;
    write_georef_tags(image.encoder(), &GeoRef::from(grid), "0")?;
    image.write_data(&interleaved)?;
    Ok(())
}

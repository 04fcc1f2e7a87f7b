//! Query footprints, UTM output frames and WGS84 ↔ UTM conversion.
//!
//! Projection formulas follow Snyder (1987), USGS Professional Paper 1395,
//! pp. 61-64, on the WGS84 ellipsoid. Zones cover EPSG 326xx (north) and
//! 327xx (south), which is what Sentinel-2 granules are delivered in.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FlowError;

const A: f64 = 6_378_137.0;
const F: f64 = 1.0 / 298.257_223_563;
const E2: f64 = 2.0 * F - F * F;
const E_PRIME2: f64 = E2 / (1.0 - E2);
const K0: f64 = 0.9996;
const FALSE_EASTING: f64 = 500_000.0;
const FALSE_NORTHING_SOUTH: f64 = 10_000_000.0;

/// Half-width in degrees of the box built around a `LAT,LON` point.
pub const POINT_BUFFER_DEG: f64 = 0.001;

/// Largest output grid accepted, in pixels (16384 x 16384).
pub const MAX_GRID_PIXELS: usize = 1 << 28;

/// Geographic bounding box in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoBox {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl GeoBox {
    pub fn new(west: f64, south: f64, east: f64, north: f64) -> Result<Self, FlowError> {
        for lon in [west, east] {
            if !(-180.0..=180.0).contains(&lon) {
                return Err(FlowError::InvalidGeometry(format!(
                    "longitude {lon} out of range"
                )));
            }
        }
        for lat in [south, north] {
            if !(-90.0..=90.0).contains(&lat) {
                return Err(FlowError::InvalidGeometry(format!(
                    "latitude {lat} out of range"
                )));
            }
        }
        if west >= east || south >= north {
            return Err(FlowError::InvalidGeometry(format!(
                "degenerate rectangle W={west} E={east} S={south} N={north}"
            )));
        }
        Ok(Self {
            west,
            south,
            east,
            north,
        })
    }

    pub fn center(&self) -> (f64, f64) {
        ((self.west + self.east) / 2.0, (self.south + self.north) / 2.0)
    }

    pub fn intersects(&self, other: &GeoBox) -> bool {
        self.west <= other.east
            && other.west <= self.east
            && self.south <= other.north
            && other.south <= self.north
    }

    /// Envelope of this box projected into a UTM zone, from its four corners.
    pub fn to_utm(&self, zone: UtmZone) -> UtmExtent {
        let corners = [
            (self.west, self.south),
            (self.west, self.north),
            (self.east, self.south),
            (self.east, self.north),
        ];
        let mut extent = UtmExtent {
            west: f64::MAX,
            south: f64::MAX,
            east: f64::MIN,
            north: f64::MIN,
        };
        for (lon, lat) in corners {
            let (e, n) = wgs84_to_utm(lon, lat, zone);
            extent.west = extent.west.min(e);
            extent.south = extent.south.min(n);
            extent.east = extent.east.max(e);
            extent.north = extent.north.max(n);
        }
        extent
    }
}

/// User intersect input: a point or a rectangle.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Intersect {
    Point { lat: f64, lon: f64 },
    Rectangle(GeoBox),
}

impl Intersect {
    pub fn footprint(&self) -> Result<GeoBox, FlowError> {
        match *self {
            Intersect::Point { lat, lon } => GeoBox::new(
                (lon - POINT_BUFFER_DEG).max(-180.0),
                (lat - POINT_BUFFER_DEG).max(-90.0),
                (lon + POINT_BUFFER_DEG).min(180.0),
                (lat + POINT_BUFFER_DEG).min(90.0),
            ),
            Intersect::Rectangle(bbox) => Ok(bbox),
        }
    }
}

impl FromStr for Intersect {
    type Err = FlowError;

    /// `LAT,LON` or `W,E,S,N`.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let numbers = parse_numbers(value)?;
        match numbers.as_slice() {
            [lat, lon] => {
                if !(-90.0..=90.0).contains(lat) || !(-180.0..=180.0).contains(lon) {
                    return Err(FlowError::InvalidGeometry(format!(
                        "point {value} out of range"
                    )));
                }
                Ok(Intersect::Point {
                    lat: *lat,
                    lon: *lon,
                })
            }
            [west, east, south, north] => Ok(Intersect::Rectangle(GeoBox::new(
                *west, *south, *east, *north,
            )?)),
            _ => Err(FlowError::InvalidGeometry(format!(
                "expected LAT,LON or W,E,S,N, got {value}"
            ))),
        }
    }
}

/// Extent in projected metres.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UtmExtent {
    pub west: f64,
    pub south: f64,
    pub east: f64,
    pub north: f64,
}

impl FromStr for UtmExtent {
    type Err = FlowError;

    /// `W,S,E,N` in local UTM coordinates.
    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let numbers = parse_numbers(value)?;
        let [west, south, east, north] = numbers.as_slice() else {
            return Err(FlowError::InvalidGeometry(format!(
                "expected W,S,E,N extent, got {value}"
            )));
        };
        if west >= east || south >= north {
            return Err(FlowError::InvalidGeometry(format!(
                "degenerate extent {value}"
            )));
        }
        Ok(Self {
            west: *west,
            south: *south,
            east: *east,
            north: *north,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UtmZone {
    pub zone: u32,
    pub north: bool,
}

impl UtmZone {
    /// Zone containing a WGS84 point, including the Norway and Svalbard exceptions.
    pub fn containing(lon: f64, lat: f64) -> Result<Self, FlowError> {
        if !(-80.0..=84.0).contains(&lat) {
            return Err(FlowError::InvalidGeometry(format!(
                "latitude {lat} is outside UTM coverage"
            )));
        }
        let mut zone = (((lon + 180.0) / 6.0).floor() as i64 + 1).clamp(1, 60) as u32;
        if (56.0..64.0).contains(&lat) && (3.0..12.0).contains(&lon) {
            zone = 32;
        }
        if (72.0..=84.0).contains(&lat) {
            zone = match lon {
                l if (0.0..9.0).contains(&l) => 31,
                l if (9.0..21.0).contains(&l) => 33,
                l if (21.0..33.0).contains(&l) => 35,
                l if (33.0..42.0).contains(&l) => 37,
                _ => zone,
            };
        }
        Ok(Self {
            zone,
            north: lat >= 0.0,
        })
    }

    pub fn from_epsg(epsg: u32) -> Option<Self> {
        if (32601..=32660).contains(&epsg) {
            Some(Self {
                zone: epsg - 32600,
                north: true,
            })
        } else if (32701..=32760).contains(&epsg) {
            Some(Self {
                zone: epsg - 32700,
                north: false,
            })
        } else {
            None
        }
    }

    pub fn epsg(&self) -> u32 {
        if self.north {
            32600 + self.zone
        } else {
            32700 + self.zone
        }
    }

    fn central_meridian(&self) -> f64 {
        ((self.zone as f64 - 1.0) * 6.0 - 180.0 + 3.0).to_radians()
    }
}

impl fmt::Display for UtmZone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EPSG:{}", self.epsg())
    }
}

/// Output pixel grid: north-up, square pixels, origin at the north-west corner.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Grid {
    pub zone: UtmZone,
    pub west: f64,
    pub north: f64,
    pub resolution: f64,
    pub width: usize,
    pub height: usize,
}

impl Grid {
    /// Grid covering `extent`, grown outward to whole pixels.
    pub fn covering(zone: UtmZone, extent: &UtmExtent, resolution: f64) -> Result<Self, FlowError> {
        if !(resolution > 0.0) || !resolution.is_finite() {
            return Err(FlowError::InvalidGeometry(format!(
                "resolution {resolution} must be positive"
            )));
        }
        let width = ((extent.east - extent.west) / resolution - 1e-9).ceil().max(1.0);
        let height = ((extent.north - extent.south) / resolution - 1e-9).ceil().max(1.0);
        if !(width * height).is_finite() || width * height > MAX_GRID_PIXELS as f64 {
            return Err(FlowError::InvalidGeometry(format!(
                "extent of {width} x {height} pixels at {resolution} m exceeds \
                 {MAX_GRID_PIXELS} pixels"
            )));
        }
        let (width, height) = (width as usize, height as usize);
        Ok(Self {
            zone,
            west: extent.west,
            north: extent.north,
            resolution,
            width,
            height,
        })
    }

    /// Like [`Grid::covering`] but with edges snapped to multiples of the resolution.
    pub fn snapped(zone: UtmZone, extent: &UtmExtent, resolution: f64) -> Result<Self, FlowError> {
        let snapped = UtmExtent {
            west: (extent.west / resolution).floor() * resolution,
            south: (extent.south / resolution).floor() * resolution,
            east: (extent.east / resolution).ceil() * resolution,
            north: (extent.north / resolution).ceil() * resolution,
        };
        Self::covering(zone, &snapped, resolution)
    }

    pub fn len(&self) -> usize {
        self.width * self.height
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn extent(&self) -> UtmExtent {
        UtmExtent {
            west: self.west,
            south: self.north - self.height as f64 * self.resolution,
            east: self.west + self.width as f64 * self.resolution,
            north: self.north,
        }
    }

    /// Projected coordinates of the centre of pixel (`col`, `row`).
    pub fn pixel_center(&self, col: usize, row: usize) -> (f64, f64) {
        (
            self.west + (col as f64 + 0.5) * self.resolution,
            self.north - (row as f64 + 0.5) * self.resolution,
        )
    }

    /// Pixel offset of `sub` inside this grid, when `sub` lies on the same lattice.
    pub fn offset_of(&self, sub: &Grid) -> Option<(usize, usize)> {
        if sub.zone != self.zone || (sub.resolution - self.resolution).abs() > 1e-9 {
            return None;
        }
        let col = (sub.west - self.west) / self.resolution;
        let row = (self.north - sub.north) / self.resolution;
        let aligned = (col - col.round()).abs() < 1e-6 && (row - row.round()).abs() < 1e-6;
        if !aligned || col < -1e-6 || row < -1e-6 {
            return None;
        }
        let (col, row) = (col.round() as usize, row.round() as usize);
        (col + sub.width <= self.width && row + sub.height <= self.height).then_some((col, row))
    }
}

/// Resolved geometry for one region: what to query, and how to frame output.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedGeometry {
    pub footprint: GeoBox,
    pub grid: Grid,
}

/// Turns intersect / extent / resolution inputs into a query footprint and an output grid.
pub fn resolve(
    intersect: Option<&Intersect>,
    extent: Option<&UtmExtent>,
    resolution: f64,
) -> Result<ResolvedGeometry, FlowError> {
    let intersect = intersect.ok_or_else(|| {
        FlowError::InvalidGeometry(
            "an intersect point or rectangle is required to infer the UTM zone".to_string(),
        )
    })?;
    let footprint = intersect.footprint()?;
    let (lon, lat) = footprint.center();
    let zone = UtmZone::containing(lon, lat)?;
    let grid = match extent {
        Some(extent) => Grid::covering(zone, extent, resolution)?,
        None => Grid::snapped(zone, &footprint.to_utm(zone), resolution)?,
    };
    Ok(ResolvedGeometry { footprint, grid })
}

fn parse_numbers(value: &str) -> Result<Vec<f64>, FlowError> {
    value
        .split(',')
        .map(|part| {
            let part = part.trim();
            part.parse::<f64>()
                .ok()
                .filter(|number| number.is_finite())
                .ok_or_else(|| {
                    FlowError::InvalidGeometry(format!("non-numeric coordinate {part:?}"))
                })
        })
        .collect()
}

/// WGS84 (longitude, latitude) in degrees to UTM (easting, northing) in metres.
pub fn wgs84_to_utm(lon_deg: f64, lat_deg: f64, zone: UtmZone) -> (f64, f64) {
    let lat = lat_deg.to_radians();
    let lon = lon_deg.to_radians();
    let lon0 = zone.central_meridian();

    let sin_lat = lat.sin();
    let cos_lat = lat.cos();
    let tan_lat = lat.tan();

    let n = A / (1.0 - E2 * sin_lat * sin_lat).sqrt();
    let t = tan_lat * tan_lat;
    let c = E_PRIME2 * cos_lat * cos_lat;
    let a = cos_lat * (lon - lon0);
    let m = meridional_arc(lat);

    let a2 = a * a;
    let a4 = a2 * a2;
    let a6 = a4 * a2;

    let easting = K0
        * n
        * (a + (1.0 - t + c) * a2 * a / 6.0
            + (5.0 - 18.0 * t + t * t + 72.0 * c - 58.0 * E_PRIME2) * a4 * a / 120.0)
        + FALSE_EASTING;
    let northing = K0
        * (m + n
            * tan_lat
            * (a2 / 2.0
                + (5.0 - t + 9.0 * c + 4.0 * c * c) * a4 / 24.0
                + (61.0 - 58.0 * t + t * t + 600.0 * c - 330.0 * E_PRIME2) * a6 / 720.0));

    if zone.north {
        (easting, northing)
    } else {
        (easting, northing + FALSE_NORTHING_SOUTH)
    }
}

/// UTM (easting, northing) in metres to WGS84 (longitude, latitude) in degrees.
pub fn utm_to_wgs84(easting: f64, northing: f64, zone: UtmZone) -> (f64, f64) {
    let x = easting - FALSE_EASTING;
    let y = if zone.north {
        northing
    } else {
        northing - FALSE_NORTHING_SOUTH
    };

    // Footpoint latitude (Snyder eq. 3-26, 7-19).
    let m = y / K0;
    let mu = m / (A * (1.0 - E2 / 4.0 - 3.0 * E2 * E2 / 64.0 - 5.0 * E2 * E2 * E2 / 256.0));
    let e1 = (1.0 - (1.0 - E2).sqrt()) / (1.0 + (1.0 - E2).sqrt());
    let phi1 = mu
        + (3.0 * e1 / 2.0 - 27.0 * e1.powi(3) / 32.0) * (2.0 * mu).sin()
        + (21.0 * e1 * e1 / 16.0 - 55.0 * e1.powi(4) / 32.0) * (4.0 * mu).sin()
        + (151.0 * e1.powi(3) / 96.0) * (6.0 * mu).sin()
        + (1097.0 * e1.powi(4) / 512.0) * (8.0 * mu).sin();

    let sin1 = phi1.sin();
    let cos1 = phi1.cos();
    let tan1 = phi1.tan();
    let c1 = E_PRIME2 * cos1 * cos1;
    let t1 = tan1 * tan1;
    let n1 = A / (1.0 - E2 * sin1 * sin1).sqrt();
    let r1 = A * (1.0 - E2) / (1.0 - E2 * sin1 * sin1).powf(1.5);
    let d = x / (n1 * K0);

    let lat = phi1
        - (n1 * tan1 / r1)
            * (d * d / 2.0
                - (5.0 + 3.0 * t1 + 10.0 * c1 - 4.0 * c1 * c1 - 9.0 * E_PRIME2) * d.powi(4)
                    / 24.0
                + (61.0 + 90.0 * t1 + 298.0 * c1 + 45.0 * t1 * t1
                    - 252.0 * E_PRIME2
                    - 3.0 * c1 * c1)
                    * d.powi(6)
                    / 720.0);
    let lon = zone.central_meridian()
        + (d - (1.0 + 2.0 * t1 + c1) * d.powi(3) / 6.0
            + (5.0 - 2.0 * c1 + 28.0 * t1 - 3.0 * c1 * c1 + 8.0 * E_PRIME2 + 24.0 * t1 * t1)
                * d.powi(5)
                / 120.0)
            / cos1;

    (lon.to_degrees(), lat.to_degrees())
}

/// Meridional arc from the equator to `lat` (radians), Snyder eq. 3-21.
fn meridional_arc(lat: f64) -> f64 {
    let e4 = E2 * E2;
    let e6 = e4 * E2;
    A * ((1.0 - E2 / 4.0 - 3.0 * e4 / 64.0 - 5.0 * e6 / 256.0) * lat
        - (3.0 * E2 / 8.0 + 3.0 * e4 / 32.0 + 45.0 * e6 / 1024.0) * (2.0 * lat).sin()
        + (15.0 * e4 / 256.0 + 45.0 * e6 / 1024.0) * (4.0 * lat).sin()
        - (35.0 * e6 / 3072.0) * (6.0 * lat).sin())
}

#[cfg(test)]
mod tests {
    use approx::assert_abs_diff_eq;
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn zone_for_aletsch() {
        let zone = UtmZone::containing(8.0, 46.45).unwrap();
        assert_eq!(zone.epsg(), 32632);
    }

    #[test]
    fn zone_norway_exception() {
        let zone = UtmZone::containing(5.3, 60.4).unwrap();
        assert_eq!(zone.zone, 32);
        let zone = UtmZone::containing(15.0, 78.0).unwrap();
        assert_eq!(zone.zone, 33);
    }

    #[test]
    fn madrid_forward() {
        let zone = UtmZone::from_epsg(32630).unwrap();
        let (e, n) = wgs84_to_utm(-3.7037, 40.4168, zone);
        assert_abs_diff_eq!(e, 440_298.94, epsilon = 1.0);
        assert_abs_diff_eq!(n, 4_474_257.31, epsilon = 1.0);
    }

    #[test]
    fn inverse_round_trip() {
        for (lon, lat) in [(8.05, 46.45), (-58.38, -34.60), (9.0, 0.5), (2.9, 71.0)] {
            let zone = UtmZone::containing(lon, lat).unwrap();
            let (e, n) = wgs84_to_utm(lon, lat, zone);
            let (lon2, lat2) = utm_to_wgs84(e, n, zone);
            assert_abs_diff_eq!(lon, lon2, epsilon = 1e-6);
            assert_abs_diff_eq!(lat, lat2, epsilon = 1e-6);
        }
    }

    #[test]
    fn grid_offsets() {
        let zone = UtmZone::from_epsg(32632).unwrap();
        let extent: UtmExtent = "400000,5100000,401000,5101000".parse().unwrap();
        let grid = Grid::covering(zone, &extent, 10.0).unwrap();
        assert_eq!((grid.width, grid.height), (100, 100));
        let sub_extent: UtmExtent = "400200,5100300,400500,5100800".parse().unwrap();
        let sub = Grid::covering(zone, &sub_extent, 10.0).unwrap();
        assert_eq!(grid.offset_of(&sub), Some((20, 20)));
        let shifted: UtmExtent = "400205,5100300,400505,5100800".parse().unwrap();
        let shifted = Grid::covering(zone, &shifted, 10.0).unwrap();
        assert_eq!(grid.offset_of(&shifted), None);
    }

    #[test]
    fn missing_intersect_cannot_infer_zone() {
        let extent: UtmExtent = "400000,5100000,401000,5101000".parse().unwrap();
        assert_matches!(
            resolve(None, Some(&extent), 10.0),
            Err(FlowError::InvalidGeometry(_))
        );
    }
}

use std::fs;

use camino::Utf8Path;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

use crate::catalog::DEFAULT_CATALOG_URL;
use crate::domain::{BandSet, Platform, Resampling};
use crate::error::FlowError;
use crate::geometry::{self, Intersect, ResolvedGeometry, UtmExtent};
use crate::query::{DEFAULT_MAX_ROWS, Query, QueryBuilder};
use crate::store::validate_region_name;
use crate::stretch::{DEFAULT_INPUT_MAX, SigmaParams};

pub const DEFAULT_REGION: &str = "composite";
pub const DEFAULT_RESOLUTION: f64 = 10.0;
pub const DEFAULT_NULL_PERCENT: f64 = 50.0;
pub const DEFAULT_CONCURRENCY: usize = 4;

/// On-disk `sentinelflow.json`.
#[derive(Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub schema_version: Option<u32>,
    #[serde(default)]
    pub catalog_url: Option<String>,
    #[serde(default)]
    pub concurrency: Option<usize>,
    #[serde(default)]
    pub resampling: Option<Resampling>,
    #[serde(default)]
    pub input_max: Option<f64>,
    #[serde(default)]
    pub passes: Option<PassSelection>,
    #[serde(default)]
    pub defaults: RegionSettings,
    #[serde(default)]
    pub regions: Vec<RegionEntry>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PassSelection {
    /// One composite per region: the clearest qualifying pass.
    #[default]
    Best,
    /// One composite per qualifying pass.
    All,
}

/// Per-region knobs. Unset fields fall back to `defaults`, then to built-ins.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct RegionSettings {
    #[serde(default)]
    pub intersect: Option<String>,
    #[serde(default)]
    pub extent: Option<String>,
    #[serde(default)]
    pub resolution: Option<f64>,
    #[serde(default)]
    pub daterange: Option<String>,
    #[serde(default)]
    pub cloudcover: Option<f64>,
    #[serde(default)]
    pub tiles: Option<String>,
    #[serde(default)]
    pub maxrows: Option<usize>,
    #[serde(default)]
    pub bands: Option<BandSet>,
    #[serde(default)]
    pub sigma: Option<String>,
    #[serde(default)]
    pub nullvalues: Option<f64>,
}

impl RegionSettings {
    /// Fields set on `self` win over `fallback`.
    pub fn or(&self, fallback: &RegionSettings) -> RegionSettings {
        RegionSettings {
            intersect: self.intersect.clone().or_else(|| fallback.intersect.clone()),
            extent: self.extent.clone().or_else(|| fallback.extent.clone()),
            resolution: self.resolution.or(fallback.resolution),
            daterange: self.daterange.clone().or_else(|| fallback.daterange.clone()),
            cloudcover: self.cloudcover.or(fallback.cloudcover),
            tiles: self.tiles.clone().or_else(|| fallback.tiles.clone()),
            maxrows: self.maxrows.or(fallback.maxrows),
            bands: self.bands.or(fallback.bands),
            sigma: self.sigma.clone().or_else(|| fallback.sigma.clone()),
            nullvalues: self.nullvalues.or(fallback.nullvalues),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegionEntry {
    pub name: String,
    #[serde(flatten)]
    pub settings: RegionSettings,
}

/// Command-line values, which override the config file.
#[derive(Debug, Clone, Default)]
pub struct RunOverrides {
    pub name: Option<String>,
    pub settings: RegionSettings,
    pub sentinel1: bool,
    pub fetch_only: bool,
    pub keep_intermediate: bool,
    pub offline: bool,
    pub concurrency: Option<usize>,
    pub catalog_url: Option<String>,
    pub all_passes: bool,
}

/// Fully validated work for one region.
#[derive(Debug, Clone)]
pub struct RegionPlan {
    pub name: String,
    pub geometry: ResolvedGeometry,
    pub query: Query,
    pub bands: BandSet,
    pub sigma: SigmaParams,
    /// Null-pixel fraction ceiling in `[0, 1]`.
    pub null_ceiling: f64,
}

#[derive(Debug, Clone)]
pub struct RunPlan {
    pub regions: Vec<RegionPlan>,
    pub fetch_only: bool,
    pub keep_intermediate: bool,
    pub offline: bool,
    pub concurrency: usize,
    pub resampling: Resampling,
    pub input_max: f64,
    pub passes: PassSelection,
    pub catalog_url: String,
}

pub struct ConfigLoader;

impl ConfigLoader {
    /// Reads `explicit` if given (must exist), else `default_path` when present.
    pub fn load(
        explicit: Option<&Utf8Path>,
        default_path: &Utf8Path,
    ) -> Result<Option<Config>, FlowError> {
        let path = match explicit {
            Some(path) => {
                if !path.as_std_path().exists() {
                    return Err(FlowError::MissingConfig(path.as_std_path().to_path_buf()));
                }
                path
            }
            None if default_path.as_std_path().exists() => default_path,
            None => return Ok(None),
        };
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|_| FlowError::ConfigRead(path.as_std_path().to_path_buf()))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|err| FlowError::ConfigParse(err.to_string()))?;
        Ok(Some(config))
    }

    /// Merges config and command line into a validated plan.
    pub fn plan(
        config: Option<Config>,
        overrides: &RunOverrides,
        today: NaiveDate,
    ) -> Result<RunPlan, FlowError> {
        let config = config.unwrap_or_default();
        let platform = if overrides.sentinel1 {
            Platform::Sentinel1
        } else {
            Platform::Sentinel2
        };

        let entries: Vec<(String, RegionSettings)> = if overrides.settings.intersect.is_some() {
            let name = overrides
                .name
                .clone()
                .unwrap_or_else(|| DEFAULT_REGION.to_string());
            let base = config
                .regions
                .iter()
                .find(|entry| entry.name == name)
                .map(|entry| entry.settings.clone())
                .unwrap_or_default();
            vec![(name, overrides.settings.or(&base))]
        } else {
            let selected: Vec<&RegionEntry> = config
                .regions
                .iter()
                .filter(|entry| {
                    overrides
                        .name
                        .as_ref()
                        .map(|name| &entry.name == name)
                        .unwrap_or(true)
                })
                .collect();
            if let Some(name) = &overrides.name
                && selected.is_empty()
                && !config.regions.is_empty()
            {
                return Err(FlowError::InvalidFilter(format!(
                    "region {name:?} is not defined in the config file"
                )));
            }
            selected
                .into_iter()
                .map(|entry| (entry.name.clone(), overrides.settings.or(&entry.settings)))
                .collect()
        };

        if entries.is_empty() {
            return Err(FlowError::InvalidGeometry(
                "no region given: pass --intersect or define regions in the config file"
                    .to_string(),
            ));
        }

        let regions = entries
            .into_iter()
            .map(|(name, settings)| {
                resolve_region(name, &settings.or(&config.defaults), platform, today)
            })
            .collect::<Result<Vec<_>, FlowError>>()?;

        let concurrency = overrides
            .concurrency
            .or(config.concurrency)
            .unwrap_or(DEFAULT_CONCURRENCY);
        if concurrency == 0 {
            return Err(FlowError::ConfigParse(
                "concurrency must be at least 1".to_string(),
            ));
        }
        let input_max = config.input_max.unwrap_or(DEFAULT_INPUT_MAX);
        if !(input_max > 0.0) {
            return Err(FlowError::ConfigParse(format!(
                "input_max {input_max} must be positive"
            )));
        }

        Ok(RunPlan {
            regions,
            fetch_only: overrides.fetch_only,
            keep_intermediate: overrides.keep_intermediate,
            offline: overrides.offline,
            concurrency,
            resampling: config.resampling.unwrap_or_default(),
            input_max,
            passes: if overrides.all_passes {
                PassSelection::All
            } else {
                config.passes.unwrap_or_default()
            },
            catalog_url: overrides
                .catalog_url
                .clone()
                .or(config.catalog_url)
                .unwrap_or_else(|| DEFAULT_CATALOG_URL.to_string()),
        })
    }
}

fn resolve_region(
    name: String,
    settings: &RegionSettings,
    platform: Platform,
    today: NaiveDate,
) -> Result<RegionPlan, FlowError> {
    validate_region_name(&name)?;
    let intersect = settings
        .intersect
        .as_deref()
        .map(str::parse::<Intersect>)
        .transpose()?;
    let extent = settings
        .extent
        .as_deref()
        .map(str::parse::<UtmExtent>)
        .transpose()?;
    let geometry = geometry::resolve(
        intersect.as_ref(),
        extent.as_ref(),
        settings.resolution.unwrap_or(DEFAULT_RESOLUTION),
    )?;

    let cloudcover = settings.cloudcover.map(|percent| percent.to_string());
    let query = QueryBuilder::new(geometry.footprint, today)
        .dates(settings.daterange.as_deref())
        .cloud_cover(cloudcover.as_deref())
        .tiles(settings.tiles.as_deref())
        .max_rows(settings.maxrows.unwrap_or(DEFAULT_MAX_ROWS))
        .platform(platform)
        .build()?;

    let sigma = match settings.sigma.as_deref() {
        Some(value) => value.parse()?,
        None => SigmaParams::default(),
    };
    let null_percent = settings.nullvalues.unwrap_or(DEFAULT_NULL_PERCENT);
    if !(0.0..=100.0).contains(&null_percent) {
        return Err(FlowError::InvalidFilter(format!(
            "null value ceiling {null_percent} outside 0-100"
        )));
    }

    Ok(RegionPlan {
        name,
        geometry,
        query,
        bands: settings.bands.unwrap_or(BandSet::Rgb).for_platform(platform),
        sigma,
        null_ceiling: null_percent / 100.0,
    })
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn today() -> NaiveDate {
        NaiveDate::from_ymd_opt(2020, 8, 15).unwrap()
    }

    #[test]
    fn cli_region_with_defaults() {
        let overrides = RunOverrides {
            settings: RegionSettings {
                intersect: Some("46.45,8.05".to_string()),
                ..RegionSettings::default()
            },
            ..RunOverrides::default()
        };
        let plan = ConfigLoader::plan(None, &overrides, today()).unwrap();
        assert_eq!(plan.regions.len(), 1);
        let region = &plan.regions[0];
        assert_eq!(region.name, DEFAULT_REGION);
        assert_eq!(region.bands, BandSet::Rgb);
        assert_eq!(region.null_ceiling, 0.5);
        assert_eq!(region.geometry.grid.zone.epsg(), 32632);
        assert_eq!(plan.concurrency, DEFAULT_CONCURRENCY);
        assert_eq!(plan.passes, PassSelection::Best);
    }

    #[test]
    fn sentinel1_forces_radar_bands() {
        let overrides = RunOverrides {
            sentinel1: true,
            settings: RegionSettings {
                intersect: Some("46.45,8.05".to_string()),
                bands: Some(BandSet::Irg),
                ..RegionSettings::default()
            },
            ..RunOverrides::default()
        };
        let plan = ConfigLoader::plan(None, &overrides, today()).unwrap();
        assert_eq!(plan.regions[0].bands, BandSet::Vvh);
        assert_eq!(plan.regions[0].query.platform, Platform::Sentinel1);
    }

    #[test]
    fn nothing_to_do_is_a_geometry_error() {
        let err = ConfigLoader::plan(None, &RunOverrides::default(), today()).unwrap_err();
        assert_matches!(err, FlowError::InvalidGeometry(_));
    }
}

use std::fs;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::NaiveDate;

use sentinelflow::config::{Config, ConfigLoader, PassSelection, RegionSettings, RunOverrides};
use sentinelflow::domain::{BandSet, Resampling};
use sentinelflow::error::FlowError;

const CONFIG: &str = r#"{
    "schema_version": 1,
    "concurrency": 2,
    "resampling": "bilinear",
    "passes": "all",
    "defaults": {
        "cloudcover": 20,
        "daterange": "20200701,20200731"
    },
    "regions": [
        {
            "name": "Aletsch",
            "intersect": "46.45,8.05",
            "extent": "420000,5140000,421000,5141000"
        },
        {
            "name": "Rhone",
            "intersect": "8.30,8.45,46.55,46.65",
            "nullvalues": 30,
            "bands": "IRG"
        }
    ]
}"#;

fn today() -> NaiveDate {
    NaiveDate::from_ymd_opt(2020, 8, 15).unwrap()
}

fn write_config(dir: &tempfile::TempDir) -> Utf8PathBuf {
    let path = Utf8PathBuf::from_path_buf(dir.path().join("sentinelflow.json")).unwrap();
    fs::write(path.as_std_path(), CONFIG).unwrap();
    path
}

fn loaded() -> Config {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);
    ConfigLoader::load(None, &path).unwrap().unwrap()
}

#[test]
fn load_default_path_when_present() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_config(&dir);
    let config = ConfigLoader::load(None, &path).unwrap().unwrap();
    assert_eq!(config.schema_version, Some(1));
    assert_eq!(config.regions.len(), 2);
    assert_eq!(config.regions[1].settings.nullvalues, Some(30.0));
    assert_eq!(config.defaults.cloudcover, Some(20.0));
}

#[test]
fn absent_default_config_is_none() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("sentinelflow.json")).unwrap();
    assert!(ConfigLoader::load(None, &path).unwrap().is_none());
}

#[test]
fn explicit_config_must_exist() {
    let err = ConfigLoader::load(
        Some(Utf8Path::new("/nonexistent/regions.json")),
        Utf8Path::new("/nonexistent/sentinelflow.json"),
    )
    .unwrap_err();
    assert_matches!(err, FlowError::MissingConfig(_));
}

#[test]
fn malformed_config_is_a_parse_error() {
    let dir = tempfile::tempdir().unwrap();
    let path = Utf8PathBuf::from_path_buf(dir.path().join("broken.json")).unwrap();
    fs::write(path.as_std_path(), "{ \"regions\": [ { \"name\": 3 } ] }").unwrap();
    let err = ConfigLoader::load(Some(path.as_path()), &path).unwrap_err();
    assert_matches!(err, FlowError::ConfigParse(_));
}

#[test]
fn plan_covers_every_config_region() {
    let plan = ConfigLoader::plan(Some(loaded()), &RunOverrides::default(), today()).unwrap();
    let names: Vec<_> = plan.regions.iter().map(|region| region.name.as_str()).collect();
    assert_eq!(names, vec!["Aletsch", "Rhone"]);
    assert_eq!(plan.concurrency, 2);
    assert_eq!(plan.resampling, Resampling::Bilinear);
    assert_eq!(plan.passes, PassSelection::All);

    let aletsch = &plan.regions[0];
    assert_eq!(aletsch.geometry.grid.width, 100);
    assert_eq!(aletsch.geometry.grid.height, 100);
    assert_eq!(aletsch.query.cloud_ceiling, 0.2);
    assert!(aletsch.query.dates.contains(NaiveDate::from_ymd_opt(2020, 7, 31).unwrap()));
    assert_eq!(aletsch.null_ceiling, 0.5);

    let rhone = &plan.regions[1];
    assert_eq!(rhone.bands, BandSet::Irg);
    assert_eq!(rhone.null_ceiling, 0.3);
    assert_eq!(rhone.geometry.grid.zone.epsg(), 32632);
}

#[test]
fn name_selects_one_region() {
    let overrides = RunOverrides {
        name: Some("Rhone".to_string()),
        ..RunOverrides::default()
    };
    let plan = ConfigLoader::plan(Some(loaded()), &overrides, today()).unwrap();
    assert_eq!(plan.regions.len(), 1);
    assert_eq!(plan.regions[0].name, "Rhone");
}

#[test]
fn unknown_region_name_is_rejected() {
    let overrides = RunOverrides {
        name: Some("Matterhorn".to_string()),
        ..RunOverrides::default()
    };
    let err = ConfigLoader::plan(Some(loaded()), &overrides, today()).unwrap_err();
    assert_matches!(err, FlowError::InvalidFilter(_));
}

#[test]
fn command_line_overrides_config_values() {
    let overrides = RunOverrides {
        name: Some("Aletsch".to_string()),
        settings: RegionSettings {
            cloudcover: Some(5.0),
            resolution: Some(20.0),
            ..RegionSettings::default()
        },
        concurrency: Some(8),
        all_passes: false,
        ..RunOverrides::default()
    };
    let plan = ConfigLoader::plan(Some(loaded()), &overrides, today()).unwrap();
    let region = &plan.regions[0];
    assert_eq!(region.query.cloud_ceiling, 0.05);
    assert_eq!(region.geometry.grid.width, 50);
    assert_eq!(plan.concurrency, 8);
}

#[test]
fn command_line_intersect_inherits_named_region() {
    let overrides = RunOverrides {
        name: Some("Aletsch".to_string()),
        settings: RegionSettings {
            intersect: Some("46.46,8.06".to_string()),
            ..RegionSettings::default()
        },
        ..RunOverrides::default()
    };
    let plan = ConfigLoader::plan(Some(loaded()), &overrides, today()).unwrap();
    assert_eq!(plan.regions.len(), 1);
    assert_eq!(plan.regions[0].geometry.grid.west, 420000.0);
}

#[test]
fn invalid_values_are_rejected() {
    let cases: [(RegionSettings, fn(&FlowError) -> bool); 4] = [
        (
            RegionSettings {
                nullvalues: Some(150.0),
                ..RegionSettings::default()
            },
            |err| matches!(err, FlowError::InvalidFilter(_)),
        ),
        (
            RegionSettings {
                sigma: Some("steep".to_string()),
                ..RegionSettings::default()
            },
            |err| matches!(err, FlowError::InvalidSigma(_)),
        ),
        (
            RegionSettings {
                daterange: Some("20200731,20200701".to_string()),
                ..RegionSettings::default()
            },
            |err| matches!(err, FlowError::InvalidFilter(_)),
        ),
        (
            RegionSettings {
                extent: Some("421000,5140000,420000,5141000".to_string()),
                ..RegionSettings::default()
            },
            |err| matches!(err, FlowError::InvalidGeometry(_)),
        ),
    ];
    for (settings, expected) in cases {
        let overrides = RunOverrides {
            settings: RegionSettings {
                intersect: Some("46.45,8.05".to_string()),
                ..settings
            },
            ..RunOverrides::default()
        };
        let err = ConfigLoader::plan(None, &overrides, today()).unwrap_err();
        assert!(expected(&err), "unexpected error {err:?}");
    }
}

#[test]
fn unsafe_region_name_is_rejected() {
    let overrides = RunOverrides {
        name: Some("../escape".to_string()),
        settings: RegionSettings {
            intersect: Some("46.45,8.05".to_string()),
            ..RegionSettings::default()
        },
        ..RunOverrides::default()
    };
    let err = ConfigLoader::plan(None, &overrides, today()).unwrap_err();
    assert_matches!(err, FlowError::InvalidFilter(_));
}

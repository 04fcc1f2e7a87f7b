use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use camino::Utf8PathBuf;
use clap::Parser;
use miette::IntoDiagnostic;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use sentinelflow::app::{App, RunResult, TracingSink};
use sentinelflow::catalog::{CatalogClient, CatalogHttpClient, Credentials, OfflineCatalog};
use sentinelflow::config::{ConfigLoader, RegionSettings, RunOverrides, RunPlan};
use sentinelflow::domain::BandSet;
use sentinelflow::error::FlowError;
use sentinelflow::output::{JsonOutput, print_summary};
use sentinelflow::store::Store;

const EXIT_NOTHING_PRODUCED: u8 = 4;
const EXIT_INTERRUPTED: u8 = 130;

#[derive(Parser)]
#[command(name = "sentinelflow")]
#[command(about = "Query, download and composite Sentinel-2 imagery for named regions")]
#[command(version, author)]
struct Cli {
    /// Catalog user name (or SENTINELFLOW_USER)
    #[arg(short = 'u', long)]
    user: Option<String>,

    /// Catalog password (or SENTINELFLOW_PASS)
    #[arg(short = 'p', long = "pass")]
    pass: Option<String>,

    /// Working directory holding the cache and outputs
    #[arg(short = 'w', long, default_value = ".")]
    workdir: Utf8PathBuf,

    /// Maximum cloud cover in percent
    #[arg(short = 'c', long)]
    cloudcover: Option<f64>,

    /// Sensing dates YYYYMMDD[,YYYYMMDD] (default: last 30 days)
    #[arg(short = 'd', long, allow_hyphen_values = true)]
    daterange: Option<String>,

    /// LAT,LON point or W,E,S,N rectangle in degrees
    #[arg(short = 'i', long, allow_hyphen_values = true)]
    intersect: Option<String>,

    /// Maximum number of products per region (default 10)
    #[arg(short = 'm', long)]
    maxrows: Option<usize>,

    /// Comma-separated tile allowlist, e.g. 32TMS,32TLS
    #[arg(short = 't', long)]
    tiles: Option<String>,

    /// Band set for the composite
    #[arg(short = 'b', long, value_enum)]
    bands: Option<BandSet>,

    /// Output extent W,S,E,N in UTM metres
    #[arg(short = 'e', long, allow_hyphen_values = true)]
    extent: Option<String>,

    /// Region name, used for output directories (default "composite")
    #[arg(short = 'n', long)]
    name: Option<String>,

    /// Output resolution in metres (default 10)
    #[arg(short = 'r', long)]
    resolution: Option<f64>,

    /// Sigmoidal contrast SLOPE,MIDPOINT[%] (default 15,50%)
    #[arg(short = 's', long)]
    sigma: Option<String>,

    /// Maximum null-pixel percentage per tile and composite (default 50)
    #[arg(short = 'x', long)]
    nullvalues: Option<f64>,

    /// Use Sentinel-1 radar products (VV,VH,VV)
    #[arg(short = '1', long)]
    sentinel1: bool,

    /// Download archives only, do not composite
    #[arg(short = 'f', long)]
    fetchonly: bool,

    /// Keep per-product intermediate GeoTIFFs
    #[arg(short = 'k', long)]
    keeptiff: bool,

    /// Work from the local cache only
    #[arg(short = 'o', long)]
    offline: bool,

    /// Config file (default: {workdir}/sentinelflow.json when present)
    #[arg(long)]
    config: Option<Utf8PathBuf>,

    /// Parallel downloads (default 4)
    #[arg(long)]
    concurrency: Option<usize>,

    /// STAC API root
    #[arg(long)]
    catalog_url: Option<String>,

    /// Write one composite per qualifying pass instead of the clearest one
    #[arg(long)]
    all_passes: bool,

    /// Print the run summary as JSON
    #[arg(long)]
    json: bool,
}

impl Cli {
    fn overrides(&self) -> RunOverrides {
        RunOverrides {
            name: self.name.clone(),
            settings: RegionSettings {
                intersect: self.intersect.clone(),
                extent: self.extent.clone(),
                resolution: self.resolution,
                daterange: self.daterange.clone(),
                cloudcover: self.cloudcover,
                tiles: self.tiles.clone(),
                maxrows: self.maxrows,
                bands: self.bands,
                sigma: self.sigma.clone(),
                nullvalues: self.nullvalues,
            },
            sentinel1: self.sentinel1,
            fetch_only: self.fetchonly,
            keep_intermediate: self.keeptiff,
            offline: self.offline,
            concurrency: self.concurrency,
            catalog_url: self.catalog_url.clone(),
            all_passes: self.all_passes,
        }
    }

    fn credentials(&self) -> Option<Credentials> {
        let user = self
            .user
            .clone()
            .or_else(|| std::env::var("SENTINELFLOW_USER").ok())?;
        let password = self
            .pass
            .clone()
            .or_else(|| std::env::var("SENTINELFLOW_PASS").ok())
            .unwrap_or_default();
        Some(Credentials { user, password })
    }
}

fn main() -> ExitCode {
    match run() {
        Ok(result) if result.is_success() => ExitCode::SUCCESS,
        Ok(_) => ExitCode::from(EXIT_NOTHING_PRODUCED),
        Err(report) => {
            eprintln!("{report:?}");
            if let Some(error) = report.downcast_ref::<FlowError>() {
                return ExitCode::from(map_exit_code(error));
            }
            ExitCode::from(1)
        }
    }
}

fn map_exit_code(error: &FlowError) -> u8 {
    match error {
        FlowError::InvalidGeometry(_)
        | FlowError::InvalidFilter(_)
        | FlowError::InvalidSigma(_)
        | FlowError::InvalidProductId(_)
        | FlowError::MissingConfig(_)
        | FlowError::ConfigRead(_)
        | FlowError::ConfigParse(_) => 2,
        FlowError::CatalogUnavailable(_)
        | FlowError::CatalogStatus { .. }
        | FlowError::Transport(_)
        | FlowError::DownloadFailed { .. } => 3,
        FlowError::Interrupted => EXIT_INTERRUPTED,
        _ => 1,
    }
}

fn run() -> miette::Result<RunResult> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let store = Store::open(cli.workdir.clone())?;
    let config = ConfigLoader::load(cli.config.as_deref(), &store.config_path())?;
    let today = chrono::Utc::now().date_naive();
    let plan = ConfigLoader::plan(config, &cli.overrides(), today)?;

    let cancel = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&cancel);
    ctrlc::set_handler(move || {
        flag.store(true, Ordering::SeqCst);
    })
    .into_diagnostic()?;

    let result = if plan.offline {
        info!("offline: using cached products only");
        execute(App::new(store.clone(), OfflineCatalog::new(store)), &plan, cancel)?
    } else {
        let client = CatalogHttpClient::new(&plan.catalog_url, cli.credentials())?;
        execute(App::new(store, client), &plan, cancel)?
    };

    if cli.json {
        JsonOutput::print_run(&result).into_diagnostic()?;
    } else {
        print_summary(&result).into_diagnostic()?;
    }
    if !result.is_success() {
        warn!("nothing was produced");
    }
    Ok(result)
}

fn execute<C: CatalogClient>(
    app: App<C>,
    plan: &RunPlan,
    cancel: Arc<AtomicBool>,
) -> Result<RunResult, FlowError> {
    let app = app.with_cancel(cancel);
    app.run(plan, &TracingSink)
}

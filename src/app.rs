use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::time::{Duration, Instant};

use camino::Utf8PathBuf;
use rayon::ThreadPool;
use rayon::prelude::*;
use serde::Serialize;
use tracing::{info, warn};

use crate::acquire::Acquirer;
use crate::catalog::{CatalogClient, RetryPolicy};
use crate::compose::{Tile, TileCompositor};
use crate::config::{PassSelection, RegionPlan, RunPlan};
use crate::domain::Product;
use crate::error::FlowError;
use crate::mosaic::{MosaicBuilder, reusable_composites};
use crate::store::Store;
use crate::stretch::SigmoidalStretch;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RegionStatus {
    /// New composite(s) written.
    Composed,
    /// Composite already on disk; nothing recomputed.
    Reused,
    /// Fetch-only run: archives acquired.
    Fetched,
    NoProducts,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegionResult {
    pub name: String,
    pub status: RegionStatus,
    pub products: Vec<String>,
    pub acquired: usize,
    pub composites: Vec<String>,
    pub error: Option<String>,
}

impl RegionResult {
    fn new(name: &str, status: RegionStatus) -> Self {
        Self {
            name: name.to_string(),
            status,
            products: Vec::new(),
            acquired: 0,
            composites: Vec::new(),
            error: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    pub regions: Vec<RegionResult>,
    pub downloads: usize,
}

impl RunResult {
    /// At least one composite produced or reused, or for fetch-only runs one product acquired.
    pub fn is_success(&self) -> bool {
        self.regions.iter().any(|region| match region.status {
            RegionStatus::Composed | RegionStatus::Reused => true,
            RegionStatus::Fetched => region.acquired > 0,
            RegionStatus::NoProducts | RegionStatus::Failed => false,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ProgressEvent {
    pub message: String,
    pub elapsed: Option<Duration>,
}

pub trait ProgressSink {
    fn event(&self, event: ProgressEvent);
}

/// Forwards progress to the log.
pub struct TracingSink;

impl ProgressSink for TracingSink {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => info!("{} ({:.1}s)", event.message, elapsed.as_secs_f64()),
            None => info!("{}", event.message),
        }
    }
}

pub struct App<C: CatalogClient> {
    store: Store,
    catalog: Arc<C>,
    acquirer: Acquirer<C>,
}

impl<C: CatalogClient> App<C> {
    pub fn new(store: Store, catalog: C) -> Self {
        let catalog = Arc::new(catalog);
        let acquirer = Acquirer::new(Arc::clone(&catalog), store.clone());
        Self {
            store,
            catalog,
            acquirer,
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.acquirer = self.acquirer.with_cancel(cancel);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.acquirer = self.acquirer.with_retry(retry);
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn catalog(&self) -> &C {
        &self.catalog
    }

    pub fn downloads(&self) -> usize {
        self.acquirer.downloads()
    }

    /// Runs every region in the plan. Region-level failures, I/O included, are
    /// reported in the result; only configuration errors and interruption abort
    /// the run.
    pub fn run(&self, plan: &RunPlan, sink: &dyn ProgressSink) -> Result<RunResult, FlowError> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(plan.concurrency)
            .thread_name(|idx| format!("acquire-{idx}"))
            .build()
            .map_err(|err| FlowError::Filesystem(format!("worker pool: {err}")))?;

        let mut regions = Vec::with_capacity(plan.regions.len());
        for region in &plan.regions {
            let start = Instant::now();
            match self.run_region(plan, region, &pool, sink) {
                Ok(result) => {
                    sink.event(ProgressEvent {
                        message: format!(
                            "phase=Done; region {} {:?}",
                            region.name, result.status
                        ),
                        elapsed: Some(start.elapsed()),
                    });
                    regions.push(result);
                }
                Err(err) if !err.is_fatal() => {
                    warn!("region {} skipped: {err}", region.name);
                    let mut result = RegionResult::new(&region.name, RegionStatus::Failed);
                    result.error = Some(err.to_string());
                    regions.push(result);
                }
                Err(err) => return Err(err),
            }
        }

        Ok(RunResult {
            regions,
            downloads: self.acquirer.downloads(),
        })
    }

    fn run_region(
        &self,
        plan: &RunPlan,
        region: &RegionPlan,
        pool: &ThreadPool,
        sink: &dyn ProgressSink,
    ) -> Result<RegionResult, FlowError> {
        let grid = &region.geometry.grid;
        sink.event(ProgressEvent {
            message: format!(
                "phase=Resolve; region {} {} {}x{} at {} m",
                region.name, grid.zone, grid.width, grid.height, grid.resolution
            ),
            elapsed: None,
        });

        if !plan.fetch_only {
            let existing = reusable_composites(
                &self.store,
                &region.name,
                grid,
                region.bands,
                &region.query.dates,
            );
            if !existing.is_empty() {
                let mut result = RegionResult::new(&region.name, RegionStatus::Reused);
                result.composites = existing.iter().map(ToString::to_string).collect();
                info!("region {} already composited", region.name);
                return Ok(result);
            }
        }

        sink.event(ProgressEvent {
            message: format!(
                "phase=Search; {} {}",
                region.query.platform,
                region.query.dates.to_interval()
            ),
            elapsed: None,
        });
        let products = self.catalog.search(&region.query)?;
        if !self.catalog.is_offline() {
            self.store.record_products(&products)?;
        }
        let mut result = RegionResult::new(&region.name, RegionStatus::NoProducts);
        result.products = products.iter().map(|product| product.id.to_string()).collect();
        if products.is_empty() {
            warn!("no products found for region {}", region.name);
            return Ok(result);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Acquire; {} products", products.len()),
            elapsed: None,
        });
        let acquired = self.acquire_all(&products, pool)?;
        result.acquired = acquired.len();

        if plan.fetch_only {
            result.status = RegionStatus::Fetched;
            return Ok(result);
        }

        sink.event(ProgressEvent {
            message: format!("phase=Compose; {} tiles", acquired.len()),
            elapsed: None,
        });
        let tiles = self.compose_all(plan, region, &acquired)?;

        sink.event(ProgressEvent {
            message: "phase=Mosaic; stitching passes".to_string(),
            elapsed: None,
        });
        let builder = MosaicBuilder::new(region.null_ceiling);
        let composites = match plan.passes {
            PassSelection::Best => vec![builder.build(&region.name, grid, &tiles)?],
            PassSelection::All => builder.build_all(&region.name, grid, &tiles)?,
        };
        for composite in &composites {
            let path = composite.write(&self.store, region.query.dates)?;
            result.composites.push(path.to_string());
        }
        result.status = RegionStatus::Composed;
        Ok(result)
    }

    /// Acquires on the bounded pool. Returns what was fetched; fails only when
    /// nothing could be acquired or on a non-recoverable error.
    fn acquire_all<'a>(
        &self,
        products: &'a [Product],
        pool: &ThreadPool,
    ) -> Result<Vec<(&'a Product, Utf8PathBuf)>, FlowError> {
        let outcomes: Vec<_> = pool.install(|| {
            products
                .par_iter()
                .map(|product| (product, self.acquirer.acquire(product)))
                .collect()
        });

        let mut acquired = Vec::new();
        let mut first_error = None;
        for (product, outcome) in outcomes {
            match outcome {
                Ok(path) => acquired.push((product, path)),
                Err(FlowError::Interrupted) => return Err(FlowError::Interrupted),
                Err(err) if err.is_region_recoverable() => {
                    warn!("{}: {err}", product.id);
                    first_error.get_or_insert(err);
                }
                Err(err) => return Err(err),
            }
        }
        match first_error {
            Some(err) if acquired.is_empty() => Err(err),
            _ => Ok(acquired),
        }
    }

    fn compose_all(
        &self,
        plan: &RunPlan,
        region: &RegionPlan,
        acquired: &[(&Product, Utf8PathBuf)],
    ) -> Result<Vec<Tile>, FlowError> {
        let stretch = SigmoidalStretch::new(region.sigma, plan.input_max)?;
        let compositor = TileCompositor::new(stretch, plan.resampling, region.null_ceiling);
        let grid = &region.geometry.grid;

        let outcomes: Vec<_> = acquired
            .par_iter()
            .map(|(product, archive)| {
                (
                    *product,
                    compositor.compose(archive, product, region.bands, grid),
                )
            })
            .collect();

        let mut tiles = Vec::with_capacity(outcomes.len());
        for (product, outcome) in outcomes {
            match outcome {
                Ok(tile) => {
                    if plan.keep_intermediate {
                        let path =
                            self.store
                                .intermediate_path(&region.name, &product.id, region.bands);
                        tile.write(&path)?;
                    }
                    tiles.push(tile);
                }
                Err(err) if err.is_region_recoverable() => {
                    warn!("cannot compose {}: {err}", product.id);
                }
                Err(err) => return Err(err),
            }
        }
        Ok(tiles)
    }
}

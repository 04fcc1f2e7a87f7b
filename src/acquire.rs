//! Cached, resumable, verified archive downloads.
//!
//! Concurrent requests for the same product share one download: the first
//! caller fetches while the others block on the in-flight slot and receive a
//! copy of its outcome.

use std::collections::HashMap;
use std::fs::{self, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use tracing::{debug, info, warn};

use crate::catalog::{CatalogClient, RetryPolicy};
use crate::domain::{Product, ProductId};
use crate::error::FlowError;
use crate::fs_util::{sha256_file, validate_zip};
use crate::store::{CacheEntry, CacheState, Store};

const CHUNK_SIZE: usize = 256 * 1024;
const RANGE_NOT_SATISFIABLE: u16 = 416;

type Outcome = Result<Utf8PathBuf, FlowError>;

/// One download in progress; waiters block until `outcome` is set.
#[derive(Default)]
struct InFlight {
    outcome: Mutex<Option<Outcome>>,
    done: Condvar,
}

impl InFlight {
    fn wait(&self) -> Outcome {
        let mut guard = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        loop {
            if let Some(outcome) = guard.as_ref() {
                return outcome.clone();
            }
            guard = match self.done.wait(guard) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }

    fn finish(&self, outcome: &Outcome) {
        let mut guard = match self.outcome.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        *guard = Some(outcome.clone());
        self.done.notify_all();
    }
}

pub struct Acquirer<C> {
    catalog: Arc<C>,
    store: Store,
    cancel: Arc<AtomicBool>,
    retry: RetryPolicy,
    in_flight: Mutex<HashMap<ProductId, Arc<InFlight>>>,
    downloads: AtomicUsize,
}

impl<C: CatalogClient> Acquirer<C> {
    pub fn new(catalog: Arc<C>, store: Store) -> Self {
        Self {
            catalog,
            store,
            cancel: Arc::new(AtomicBool::new(false)),
            retry: RetryPolicy::default(),
            in_flight: Mutex::new(HashMap::new()),
            downloads: AtomicUsize::new(0),
        }
    }

    pub fn with_cancel(mut self, cancel: Arc<AtomicBool>) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Completed network downloads in this session.
    pub fn downloads(&self) -> usize {
        self.downloads.load(Ordering::Relaxed)
    }

    /// Local path of the verified archive for `product`, downloading it if needed.
    pub fn acquire(&self, product: &Product) -> Result<Utf8PathBuf, FlowError> {
        if let Some(path) = self.cached(&product.id) {
            debug!("cache hit for {}", product.id);
            return Ok(path);
        }
        if self.catalog.is_offline() {
            return Err(FlowError::ProductNotCached(product.id.to_string()));
        }

        let (slot, leader) = {
            let mut in_flight = match self.in_flight.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            match in_flight.get(&product.id) {
                Some(slot) => (Arc::clone(slot), false),
                None => {
                    let slot = Arc::new(InFlight::default());
                    in_flight.insert(product.id.clone(), Arc::clone(&slot));
                    (slot, true)
                }
            }
        };

        if !leader {
            debug!("waiting on in-flight download of {}", product.id);
            return slot.wait();
        }

        // Another leader may have finished between the cache check and the insert.
        let outcome = match self.cached(&product.id) {
            Some(path) => Ok(path),
            None => self.fetch(product),
        };
        slot.finish(&outcome);
        let mut in_flight = match self.in_flight.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        in_flight.remove(&product.id);
        outcome
    }

    fn cached(&self, id: &ProductId) -> Option<Utf8PathBuf> {
        if self.store.is_complete(id) {
            self.store.entry(id).map(|entry| entry.path)
        } else {
            None
        }
    }

    fn fetch(&self, product: &Product) -> Result<Utf8PathBuf, FlowError> {
        let mut attempt = 0;
        loop {
            match self.download_verified(product) {
                Err(FlowError::IntegrityError { reason, .. }) if attempt == 0 => {
                    warn!(
                        "integrity check failed for {}: {reason}; downloading again",
                        product.id
                    );
                    self.discard(&product.id)?;
                    attempt += 1;
                }
                Err(err @ FlowError::IntegrityError { .. }) => {
                    self.discard(&product.id)?;
                    return Err(err);
                }
                other => return other,
            }
        }
    }

    fn discard(&self, id: &ProductId) -> Result<(), FlowError> {
        let part = self.store.part_path(id);
        if part.as_std_path().exists() {
            fs::remove_file(part.as_std_path())
                .map_err(|err| FlowError::Filesystem(format!("{part}: {err}")))?;
        }
        self.store.remove_entry(id)
    }

    fn download_verified(&self, product: &Product) -> Result<Utf8PathBuf, FlowError> {
        let id = &product.id;
        let part = self.store.part_path(id);
        self.store.put_entry(
            id,
            CacheEntry {
                path: part.clone(),
                state: CacheState::Partial,
                bytes: file_len(&part),
                checksum: product.checksum.clone(),
                updated_at: Utc::now(),
            },
        )?;

        let held = file_len(&part);
        if product.size.is_some_and(|size| held > 0 && held >= size) {
            debug!("part file of {id} already holds {held} bytes; verifying");
        } else {
            info!("downloading {id}");
            self.retry
                .run(&format!("download of {id}"), || self.stream_to_part(product, &part))
                .map_err(|err| match err {
                    FlowError::Transport(reason) => FlowError::DownloadFailed {
                        id: id.to_string(),
                        reason,
                    },
                    FlowError::CatalogStatus { status, message } => FlowError::DownloadFailed {
                        id: id.to_string(),
                        reason: format!("status {status}: {message}"),
                    },
                    other => other,
                })?;
            self.downloads.fetch_add(1, Ordering::Relaxed);
        }

        let (bytes, checksum) = verify(product, &part)?;
        let archive = self.store.archive_path(id);
        fs::rename(part.as_std_path(), archive.as_std_path())
            .map_err(|err| FlowError::Filesystem(format!("{archive}: {err}")))?;
        self.store.put_entry(
            id,
            CacheEntry {
                path: archive.clone(),
                state: CacheState::Complete,
                bytes,
                checksum: Some(checksum),
                updated_at: Utc::now(),
            },
        )?;
        info!("stored {id} ({bytes} bytes)");
        Ok(archive)
    }

    /// One transfer attempt, resuming from whatever the part file already holds.
    fn stream_to_part(&self, product: &Product, part: &Utf8Path) -> Result<(), FlowError> {
        if self.cancel.load(Ordering::SeqCst) {
            return Err(FlowError::Interrupted);
        }
        let mut offset = file_len(part);
        let mut stream = match self.catalog.download(product, offset) {
            Err(FlowError::CatalogStatus {
                status: RANGE_NOT_SATISFIABLE,
                ..
            }) if offset > 0 => {
                debug!("range {offset}- rejected for {}; restarting", product.id);
                offset = 0;
                self.catalog.download(product, 0)?
            }
            other => other?,
        };
        let append = offset > 0 && stream.resumed;
        if offset > 0 && !append {
            debug!("server ignored range request for {}; restarting", product.id);
        }
        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .append(append)
            .truncate(!append)
            .open(part.as_std_path())
            .map_err(|err| FlowError::Filesystem(format!("{part}: {err}")))?;

        let mut buffer = vec![0u8; CHUNK_SIZE];
        loop {
            if self.cancel.load(Ordering::SeqCst) {
                file.flush()
                    .map_err(|err| FlowError::Filesystem(err.to_string()))?;
                self.record_partial(product, part)?;
                return Err(FlowError::Interrupted);
            }
            let read = match stream.reader.read(&mut buffer) {
                Ok(read) => read,
                Err(err) => {
                    self.record_partial(product, part)?;
                    return Err(FlowError::Transport(err.to_string()));
                }
            };
            if read == 0 {
                break;
            }
            file.write_all(&buffer[..read])
                .map_err(|err| FlowError::Filesystem(format!("{part}: {err}")))?;
        }
        file.flush()
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        Ok(())
    }

    fn record_partial(&self, product: &Product, part: &Utf8Path) -> Result<(), FlowError> {
        self.store.put_entry(
            &product.id,
            CacheEntry {
                path: part.to_path_buf(),
                state: CacheState::Partial,
                bytes: file_len(part),
                checksum: product.checksum.clone(),
                updated_at: Utc::now(),
            },
        )
    }
}

/// Size, checksum and archive readability. Returns the size and SHA-256 on success.
fn verify(product: &Product, part: &Utf8Path) -> Result<(u64, String), FlowError> {
    let integrity = |reason: String| FlowError::IntegrityError {
        id: product.id.to_string(),
        reason,
    };
    let bytes = file_len(part);
    if let Some(expected) = product.size
        && expected != bytes
    {
        return Err(integrity(format!("expected {expected} bytes, got {bytes}")));
    }
    let checksum = sha256_file(part.as_std_path())?;
    if let Some(expected) = &product.checksum
        && !expected.eq_ignore_ascii_case(&checksum)
    {
        return Err(integrity(format!("sha256 {checksum} does not match {expected}")));
    }
    validate_zip(part.as_std_path()).map_err(|err| integrity(err.to_string()))?;
    Ok((bytes, checksum))
}

fn file_len(path: &Utf8Path) -> u64 {
    fs::metadata(path.as_std_path())
        .map(|meta| meta.len())
        .unwrap_or(0)
}

use std::collections::BTreeMap;
use std::fs;
use std::sync::{Arc, Mutex, MutexGuard};

use camino::{Utf8Path, Utf8PathBuf};
use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::{BandSet, Product, ProductId};
use crate::error::FlowError;

pub const CONFIG_FILE: &str = "sentinelflow.json";

/// Working directory layout plus the shared cache index.
#[derive(Debug, Clone)]
pub struct Store {
    workdir: Utf8PathBuf,
    index: Arc<Mutex<CacheIndex>>,
}

impl Store {
    /// Opens `workdir`, creating the cache layout and loading `cache/index.json`.
    pub fn open(workdir: Utf8PathBuf) -> Result<Self, FlowError> {
        let store = Self {
            workdir,
            index: Arc::new(Mutex::new(CacheIndex::default())),
        };
        fs::create_dir_all(store.archives_dir().as_std_path())
            .map_err(|err| FlowError::Filesystem(format!("{}: {err}", store.archives_dir())))?;
        let index = CacheIndex::load(&store.index_path())?;
        *store.lock() = index;
        Ok(store)
    }

    pub fn workdir(&self) -> &Utf8Path {
        &self.workdir
    }

    pub fn config_path(&self) -> Utf8PathBuf {
        self.workdir.join(CONFIG_FILE)
    }

    pub fn cache_dir(&self) -> Utf8PathBuf {
        self.workdir.join("cache")
    }

    pub fn index_path(&self) -> Utf8PathBuf {
        self.cache_dir().join("index.json")
    }

    pub fn archives_dir(&self) -> Utf8PathBuf {
        self.cache_dir().join("archives")
    }

    pub fn archive_path(&self, id: &ProductId) -> Utf8PathBuf {
        self.archives_dir().join(format!("{id}.zip"))
    }

    pub fn part_path(&self, id: &ProductId) -> Utf8PathBuf {
        self.archives_dir().join(format!("{id}.zip.part"))
    }

    pub fn intermediate_path(&self, region: &str, id: &ProductId, bands: BandSet) -> Utf8PathBuf {
        self.workdir
            .join("intermediate")
            .join(region)
            .join(format!("{id}_{bands}.tif"))
    }

    pub fn composite_path(&self, region: &str, date: NaiveDate, bands: BandSet) -> Utf8PathBuf {
        self.workdir
            .join("composite")
            .join(region)
            .join(format!("{}_{bands}.tif", date.format("%Y%m%d")))
    }

    /// Composites already written for a region and band set, any date.
    pub fn existing_composites(&self, region: &str, bands: BandSet) -> Vec<Utf8PathBuf> {
        let dir = self.workdir.join("composite").join(region);
        let suffix = format!("_{bands}.tif");
        let Ok(entries) = dir.read_dir_utf8() else {
            return Vec::new();
        };
        let mut found: Vec<Utf8PathBuf> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.into_path())
            .filter(|path| {
                path.file_name()
                    .map(|name| name.ends_with(&suffix))
                    .unwrap_or(false)
            })
            .collect();
        found.sort();
        found
    }

    fn lock(&self) -> MutexGuard<'_, CacheIndex> {
        match self.index.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn entry(&self, id: &ProductId) -> Option<CacheEntry> {
        self.lock().entries.get(id).cloned()
    }

    /// Inserts or replaces the entry for `id` and persists the index.
    pub fn put_entry(&self, id: &ProductId, entry: CacheEntry) -> Result<(), FlowError> {
        let mut index = self.lock();
        index.entries.insert(id.clone(), entry);
        index.save(&self.index_path())
    }

    pub fn remove_entry(&self, id: &ProductId) -> Result<(), FlowError> {
        let mut index = self.lock();
        if index.entries.remove(id).is_some() {
            index.save(&self.index_path())?;
        }
        Ok(())
    }

    /// Records catalog search results so offline runs can find them later.
    pub fn record_products(&self, products: &[Product]) -> Result<(), FlowError> {
        if products.is_empty() {
            return Ok(());
        }
        let mut index = self.lock();
        for product in products {
            index.products.insert(product.id.clone(), product.clone());
        }
        index.save(&self.index_path())
    }

    pub fn known_products(&self) -> Vec<Product> {
        self.lock().products.values().cloned().collect()
    }

    /// True when the entry is complete and its archive is on disk with the recorded size.
    pub fn is_complete(&self, id: &ProductId) -> bool {
        let Some(entry) = self.entry(id) else {
            return false;
        };
        if entry.state != CacheState::Complete {
            return false;
        }
        fs::metadata(entry.path.as_std_path())
            .map(|meta| meta.len() == entry.bytes)
            .unwrap_or(false)
    }

    pub fn write_bytes_atomic(path: &Utf8Path, content: &[u8]) -> Result<(), FlowError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent.as_std_path())
                .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        }
        let tmp_path = Utf8PathBuf::from(format!("{path}.tmp"));
        fs::write(tmp_path.as_std_path(), content)
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        fs::rename(tmp_path.as_std_path(), path.as_std_path())
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        Ok(())
    }

    /// Streams into a temp file beside `path`, then persists it over `path`.
    pub fn write_file_atomic<F>(path: &Utf8Path, write: F) -> Result<(), FlowError>
    where
        F: FnOnce(&mut fs::File) -> Result<(), FlowError>,
    {
        let parent = path
            .parent()
            .ok_or_else(|| FlowError::Filesystem(format!("invalid destination path {path}")))?;
        fs::create_dir_all(parent.as_std_path())
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        let mut temp = tempfile::Builder::new()
            .prefix(".sentinelflow")
            .tempfile_in(parent.as_std_path())
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        write(temp.as_file_mut())?;
        temp.persist(path.as_std_path())
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        Ok(())
    }

    pub fn write_json_atomic<T: Serialize>(path: &Utf8Path, value: &T) -> Result<(), FlowError> {
        let content = serde_json::to_vec_pretty(value)
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        Self::write_bytes_atomic(path, &content)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheState {
    Partial,
    Complete,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub path: Utf8PathBuf,
    pub state: CacheState,
    pub bytes: u64,
    #[serde(default)]
    pub checksum: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// On-disk `cache/index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    #[serde(default)]
    pub products: BTreeMap<ProductId, Product>,
    #[serde(default)]
    pub entries: BTreeMap<ProductId, CacheEntry>,
}

impl CacheIndex {
    pub fn load(path: &Utf8Path) -> Result<Self, FlowError> {
        if !path.as_std_path().exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path.as_std_path())
            .map_err(|err| FlowError::Filesystem(format!("{path}: {err}")))?;
        serde_json::from_str(&content)
            .map_err(|err| FlowError::Filesystem(format!("corrupt cache index {path}: {err}")))
    }

    pub fn save(&self, path: &Utf8Path) -> Result<(), FlowError> {
        Store::write_json_atomic(path, self)
    }
}

/// Region names become directory names.
pub fn validate_region_name(name: &str) -> Result<(), FlowError> {
    let valid = !name.is_empty()
        && name != "."
        && name != ".."
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(FlowError::InvalidFilter(format!("region name {name:?}")))
    }
}

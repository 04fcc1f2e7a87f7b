mod common;

use std::fs;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::thread;

use assert_matches::assert_matches;
use chrono::NaiveDate;

use sentinelflow::acquire::Acquirer;
use sentinelflow::catalog::{OfflineCatalog, RetryPolicy};
use sentinelflow::error::FlowError;
use sentinelflow::store::CacheState;

use common::{MockCatalog, product, rgb_archive, temp_store};

const ID: &str = "S2A_MSIL1C_20200715T102031_N0209_R065_T32TMS_20200715T123456";

fn fixture() -> (sentinelflow::domain::Product, Vec<u8>) {
    let bytes = rgb_archive(common::WEST, 4, 4, &[1000u16; 16]);
    let date = NaiveDate::from_ymd_opt(2020, 7, 15).unwrap();
    (product(ID, date, 0.05, &bytes), bytes)
}

#[test]
fn acquire_twice_downloads_once() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes.clone())]));
    let acquirer =
        Acquirer::new(Arc::clone(&catalog), store.clone()).with_retry(RetryPolicy::immediate());

    let first = acquirer.acquire(&product).unwrap();
    let second = acquirer.acquire(&product).unwrap();

    assert_eq!(first, second);
    assert_eq!(catalog.download_count(), 1);
    assert_eq!(acquirer.downloads(), 1);
    assert_eq!(fs::read(first.as_std_path()).unwrap(), bytes);
    let entry = store.entry(&product.id).unwrap();
    assert_eq!(entry.state, CacheState::Complete);
    assert_eq!(entry.bytes, bytes.len() as u64);
}

#[test]
fn concurrent_acquires_share_one_download() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes)]));
    let acquirer = Arc::new(
        Acquirer::new(Arc::clone(&catalog), store).with_retry(RetryPolicy::immediate()),
    );

    let handles: Vec<_> = (0..4)
        .map(|_| {
            let acquirer = Arc::clone(&acquirer);
            let product = product.clone();
            thread::spawn(move || acquirer.acquire(&product))
        })
        .collect();
    let paths: Vec<_> = handles
        .into_iter()
        .map(|handle| handle.join().unwrap().unwrap())
        .collect();

    assert!(paths.windows(2).all(|pair| pair[0] == pair[1]));
    assert_eq!(catalog.download_count(), 1);
}

#[test]
fn cache_survives_reopening_the_store() {
    let (dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes)]));
    Acquirer::new(Arc::clone(&catalog), store)
        .acquire(&product)
        .unwrap();

    let workdir = camino::Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap();
    let reopened = sentinelflow::store::Store::open(workdir).unwrap();
    let acquirer = Acquirer::new(Arc::clone(&catalog), reopened);
    acquirer.acquire(&product).unwrap();
    assert_eq!(catalog.download_count(), 1);
}

#[test]
fn offline_with_empty_cache_is_not_cached() {
    let (_dir, store) = temp_store();
    let (product, _) = fixture();
    let acquirer = Acquirer::new(Arc::new(OfflineCatalog::new(store.clone())), store.clone());

    assert_matches!(
        acquirer.acquire(&product),
        Err(FlowError::ProductNotCached(id)) if id == ID
    );
    assert_eq!(acquirer.downloads(), 0);
    assert!(store.entry(&product.id).is_none());
}

#[test]
fn resumes_partial_download_with_range() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let half = bytes.len() / 2;
    fs::write(store.part_path(&product.id).as_std_path(), &bytes[..half]).unwrap();

    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes.clone())]));
    let acquirer = Acquirer::new(Arc::clone(&catalog), store.clone());
    let path = acquirer.acquire(&product).unwrap();

    assert_eq!(*catalog.offsets.lock().unwrap(), vec![half as u64]);
    assert_eq!(fs::read(path.as_std_path()).unwrap(), bytes);
    assert!(!store.part_path(&product.id).as_std_path().exists());
}

#[test]
fn ignored_range_rewrites_from_scratch() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    fs::write(store.part_path(&product.id).as_std_path(), b"stale").unwrap();

    let mut catalog = MockCatalog::new(vec![(product.clone(), bytes.clone())]);
    catalog.honour_range = false;
    let acquirer = Acquirer::new(Arc::new(catalog), store);
    let path = acquirer.acquire(&product).unwrap();
    assert_eq!(fs::read(path.as_std_path()).unwrap(), bytes);
}

#[test]
fn corrupt_download_is_retried_once() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes.clone())]));
    *catalog.corrupt_first.lock().unwrap() = 1;
    let acquirer = Acquirer::new(Arc::clone(&catalog), store);

    let path = acquirer.acquire(&product).unwrap();
    assert_eq!(catalog.download_count(), 2);
    assert_eq!(fs::read(path.as_std_path()).unwrap(), bytes);
}

#[test]
fn persistent_corruption_is_an_integrity_error() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes)]));
    *catalog.corrupt_first.lock().unwrap() = 2;
    let acquirer = Acquirer::new(Arc::clone(&catalog), store.clone());

    assert_matches!(
        acquirer.acquire(&product),
        Err(FlowError::IntegrityError { .. })
    );
    assert_eq!(catalog.download_count(), 2);
    assert!(store.entry(&product.id).is_none());
    assert!(!store.part_path(&product.id).as_std_path().exists());
}

#[test]
fn cancelled_download_stays_partial() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes)]));
    let cancel = Arc::new(AtomicBool::new(true));
    let acquirer = Acquirer::new(Arc::clone(&catalog), store.clone()).with_cancel(cancel);

    assert_matches!(acquirer.acquire(&product), Err(FlowError::Interrupted));
    let entry = store.entry(&product.id).unwrap();
    assert_eq!(entry.state, CacheState::Partial);
}

#[test]
fn unknown_archive_fails_without_retrying_client_errors() {
    let (_dir, store) = temp_store();
    let (product, _) = fixture();
    let catalog = Arc::new(MockCatalog::default());
    let acquirer =
        Acquirer::new(Arc::clone(&catalog), store).with_retry(RetryPolicy::immediate());

    assert_matches!(
        acquirer.acquire(&product),
        Err(FlowError::DownloadFailed { .. })
    );
    assert_eq!(catalog.download_count(), 1);
}

#[test]
fn complete_part_file_is_verified_without_a_request() {
    let (_dir, store) = temp_store();
    let (product, bytes) = fixture();
    fs::write(store.part_path(&product.id).as_std_path(), &bytes).unwrap();

    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes.clone())]));
    let acquirer = Acquirer::new(Arc::clone(&catalog), store.clone());
    let path = acquirer.acquire(&product).unwrap();

    assert_eq!(catalog.download_count(), 0);
    assert_eq!(acquirer.downloads(), 0);
    assert_eq!(fs::read(path.as_std_path()).unwrap(), bytes);
    assert_eq!(store.entry(&product.id).unwrap().state, CacheState::Complete);
}

#[test]
fn unsatisfiable_range_restarts_from_zero() {
    let (_dir, store) = temp_store();
    let (mut product, bytes) = fixture();
    product.size = None;
    fs::write(store.part_path(&product.id).as_std_path(), &bytes).unwrap();

    let catalog = Arc::new(MockCatalog::new(vec![(product.clone(), bytes.clone())]));
    let acquirer =
        Acquirer::new(Arc::clone(&catalog), store).with_retry(RetryPolicy::immediate());
    let path = acquirer.acquire(&product).unwrap();

    assert_eq!(
        *catalog.offsets.lock().unwrap(),
        vec![bytes.len() as u64, 0]
    );
    assert_eq!(fs::read(path.as_std_path()).unwrap(), bytes);
}

use std::fs;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};
use zip::ZipArchive;

use crate::error::FlowError;

/// Reads every entry to the end so truncated or corrupt members are caught.
pub fn validate_zip(zip_path: &Path) -> Result<(), FlowError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| FlowError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive =
        ZipArchive::new(file).map_err(|err| FlowError::Filesystem(err.to_string()))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        if entry.is_dir() {
            continue;
        }
        io::copy(&mut entry, &mut io::sink())
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
    }
    Ok(())
}

/// File member names, with path traversal entries skipped.
pub fn list_entries(zip_path: &Path) -> Result<Vec<String>, FlowError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| FlowError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file)?;
    let mut names = Vec::with_capacity(archive.len());
    for i in 0..archive.len() {
        let entry = archive.by_index(i)?;
        if entry.is_dir() || entry.enclosed_name().is_none() {
            continue;
        }
        names.push(entry.name().to_string());
    }
    Ok(names)
}

pub fn read_entry(zip_path: &Path, name: &str) -> Result<Vec<u8>, FlowError> {
    let file = fs::File::open(zip_path)
        .map_err(|err| FlowError::Filesystem(format!("open zip {}: {err}", zip_path.display())))?;
    let mut archive = ZipArchive::new(file)?;
    let mut entry = archive.by_name(name)?;
    let mut bytes = Vec::with_capacity(entry.size() as usize);
    entry
        .read_to_end(&mut bytes)
        .map_err(|err| FlowError::Raster(format!("read {name}: {err}")))?;
    Ok(bytes)
}

/// Lowercase hex SHA-256 of a file.
pub fn sha256_file(path: &Path) -> Result<String, FlowError> {
    let mut file = fs::File::open(path)
        .map_err(|err| FlowError::Filesystem(format!("open {}: {err}", path.display())))?;
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let read = file
            .read(&mut buffer)
            .map_err(|err| FlowError::Filesystem(err.to_string()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

//! On-disk snapshot format.
//!
//! The current shape is `{"records": [...], "sessions": {token: session}}`. Files written by
//! earlier versions hold a bare array of records and no sessions; those are still readable and
//! are rewritten in the current shape on the next mutation.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use super::StoreError;
use crate::ledger::VerificationRecord;
use crate::session::SessionRecord;

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct Snapshot {
    #[serde(default)]
    pub records: Vec<VerificationRecord>,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub sessions: HashMap<String, SessionRecord>,
}

/// Reads the snapshot at `path`. A missing or blank file is `Ok(None)`.
pub fn read(path: &Path) -> Result<Option<Snapshot>, StoreError> {
    let raw = match std::fs::read(path) {
        Ok(raw) => raw,
        Err(error) if error.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(StoreError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let trimmed = raw.trim_ascii();
    let decode_error = |source| StoreError::Decode {
        path: path.to_path_buf(),
        source,
    };
    match trimmed.first() {
        None => Ok(None),
        Some(b'[') => {
            let records: Vec<VerificationRecord> =
                serde_json::from_slice(trimmed).map_err(decode_error)?;
            Ok(Some(Snapshot {
                records,
                sessions: HashMap::new(),
            }))
        }
        Some(_) => serde_json::from_slice(trimmed)
            .map(Some)
            .map_err(decode_error),
    }
}

/// Replaces the snapshot at `path` atomically.
///
/// The snapshot is written to a temporary file in the same directory, flushed, then renamed over
/// `path`. A crash leaves either the old or the new file, never a truncated one.
pub fn write(path: &Path, snapshot: &Snapshot) -> Result<(), StoreError> {
    let dir = path
        .parent()
        .filter(|dir| !dir.as_os_str().is_empty())
        .unwrap_or(Path::new("."));
    let io_error = |source| StoreError::Io {
        path: path.to_path_buf(),
        source,
    };
    std::fs::create_dir_all(dir).map_err(io_error)?;

    let encoded = serde_json::to_vec(snapshot).map_err(StoreError::Encode)?;
    let mut file = NamedTempFile::new_in(dir).map_err(io_error)?;
    file.write_all(&encoded).map_err(io_error)?;
    file.as_file().sync_all().map_err(io_error)?;
    file.persist(path).map_err(|error| StoreError::Io {
        path: path.to_path_buf(),
        source: error.error,
    })?;
    Ok(())
}

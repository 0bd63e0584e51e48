//! Persisted uploaded-block set
//!
//! The shipper remembers which blocks it has already shipped in a small
//! versioned JSON document next to the data directory. The document is an
//! optimization that saves per-block bucket existence probes; the bucket
//! stays authoritative, so losing the document only costs extra round trips
//! on the next pass.

use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use ulid::Ulid;

/// Default JSON filename for the upload log.
pub const DEFAULT_LOG_FILENAME: &str = "thanos.shipper.json";

/// The single recognized document version.
pub const LOG_VERSION_1: u32 = 1;

/// Upload log document: the set of block ids believed durable in the bucket.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadLog {
    pub version: u32,
    #[serde(default)]
    pub uploaded: Vec<Ulid>,
}

impl Default for UploadLog {
    fn default() -> Self {
        Self {
            version: LOG_VERSION_1,
            uploaded: Vec::new(),
        }
    }
}

/// Read the upload log from `path`.
///
/// Any version other than [`LOG_VERSION_1`] is an error; callers decide
/// whether an unreadable log is fatal (the shipper treats it as empty).
pub fn read_log(path: &Path) -> Result<UploadLog> {
    let bytes = fs::read(path)?;
    let log: UploadLog = serde_json::from_slice(&bytes)
        .map_err(|e| Error::Serialization(format!("parse {}: {e}", path.display())))?;
    if log.version != LOG_VERSION_1 {
        return Err(Error::UploadLogVersion {
            version: log.version,
        });
    }
    Ok(log)
}

/// Atomically replace the upload log at `path`.
///
/// Write order: temp sibling, flush to stable storage, rename over the
/// target, flush the containing directory. A crash before the rename leaves
/// the previous log intact; a crash between rename and directory flush may
/// lose the rename but never the content.
pub fn write_log(path: &Path, log: &UploadLog) -> Result<()> {
    let tmp = path.with_extension("json.tmp");

    let mut f = File::create(&tmp)?;
    f.write_all(&serde_json::to_vec_pretty(log)?)?;
    f.sync_all()?;
    drop(f);

    fs::rename(&tmp, path)?;

    if let Some(parent) = path.parent() {
        File::open(parent)?.sync_all()?;
    }
    Ok(())
}

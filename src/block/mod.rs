//! On-disk block model
//!
//! A block is an immutable directory named by its ULID, holding a
//! `meta.json` document, an `index` file and a `chunks/` subdirectory of
//! segment files. Only the meta document is interpreted here; index and
//! chunk payloads are opaque to the shipper.

use crate::labels::LabelSet;
use crate::{Error, Result};

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use ulid::Ulid;

/// JSON filename holding the block metadata.
pub const META_FILENAME: &str = "meta.json";

/// Name of the block index file.
pub const INDEX_FILENAME: &str = "index";

/// Name of the segment file subdirectory.
pub const CHUNKS_DIRNAME: &str = "chunks";

/// Recognized version of the meta document.
pub const META_VERSION_1: u32 = 1;

/// Block metadata as stored in `meta.json`.
///
/// The `thanos` key carries the provenance extension the shipper attaches
/// before upload; the key name is kept for on-disk compatibility.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub ulid: Ulid,
    #[serde(rename = "minTime")]
    pub min_time: i64,
    #[serde(rename = "maxTime")]
    pub max_time: i64,
    pub version: u32,
    #[serde(default)]
    pub stats: BlockStats,
    #[serde(default)]
    pub compaction: BlockCompaction,
    #[serde(rename = "thanos", default)]
    pub extension: BlockExtension,
}

/// Sample statistics for a block.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockStats {
    #[serde(rename = "numSamples", default)]
    pub num_samples: u64,
    #[serde(rename = "numSeries", default, skip_serializing_if = "is_zero")]
    pub num_series: u64,
}

fn is_zero(v: &u64) -> bool {
    *v == 0
}

/// Compaction lineage for a block. Level 1 is raw ingestion; higher levels
/// are merged blocks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockCompaction {
    pub level: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<Ulid>,
}

impl Default for BlockCompaction {
    fn default() -> Self {
        Self {
            level: 1,
            sources: Vec::new(),
        }
    }
}

/// Provenance extension merged into the meta document at upload time.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BlockExtension {
    #[serde(default)]
    pub labels: LabelSet,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub source: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub segment_files: Vec<String>,
}

impl BlockMeta {
    /// Read a block's metadata from its directory.
    pub fn read_from_dir(dir: &Path) -> Result<Self> {
        let path = dir.join(META_FILENAME);
        let bytes = fs::read(&path).map_err(|e| Error::BlockMeta {
            block: dir.display().to_string(),
            reason: format!("read {}: {e}", path.display()),
        })?;
        let meta: BlockMeta = serde_json::from_slice(&bytes).map_err(|e| Error::BlockMeta {
            block: dir.display().to_string(),
            reason: format!("parse {}: {e}", path.display()),
        })?;
        if meta.version != META_VERSION_1 {
            return Err(Error::BlockMeta {
                block: dir.display().to_string(),
                reason: format!("unexpected meta version {}", meta.version),
            });
        }
        Ok(meta)
    }

    /// Write the metadata into `dir/meta.json` via a temp sibling + rename,
    /// so concurrent readers never observe a torn document.
    pub fn write_to_dir(&self, dir: &Path) -> Result<()> {
        let tmp = dir.join(format!("{META_FILENAME}.tmp"));
        let data = serde_json::to_vec_pretty(self)?;
        fs::write(&tmp, data)?;
        fs::rename(&tmp, dir.join(META_FILENAME))?;
        Ok(())
    }
}

/// Returns the block id iff `name` has the ULID shape of a block directory.
pub fn is_block_dir(name: &str) -> Option<Ulid> {
    Ulid::from_string(name).ok()
}

/// Sorted `chunks/`-relative names of a block's segment files.
pub fn segment_files(block_dir: &Path) -> Result<Vec<String>> {
    let chunk_dir = block_dir.join(CHUNKS_DIRNAME);
    let mut files = Vec::new();
    for entry in fs::read_dir(&chunk_dir)? {
        let entry = entry?;
        files.push(entry.file_name().to_string_lossy().into_owned());
    }
    files.sort();
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_meta() -> BlockMeta {
        BlockMeta {
            ulid: Ulid::new(),
            min_time: 100,
            max_time: 200,
            version: META_VERSION_1,
            stats: BlockStats {
                num_samples: 42,
                num_series: 0,
            },
            compaction: BlockCompaction::default(),
            extension: BlockExtension {
                labels: [("tenant", "a")].into_iter().collect(),
                source: "shipper".to_string(),
                segment_files: vec!["000001".to_string()],
            },
        }
    }

    #[test]
    fn test_meta_roundtrip() {
        let dir = TempDir::new().unwrap();
        let meta = sample_meta();
        meta.write_to_dir(dir.path()).unwrap();
        let read = BlockMeta::read_from_dir(dir.path()).unwrap();
        assert_eq!(read, meta);
    }

    #[test]
    fn test_meta_rejects_unknown_version() {
        let dir = TempDir::new().unwrap();
        let mut meta = sample_meta();
        meta.version = 7;
        meta.write_to_dir(dir.path()).unwrap();
        assert!(BlockMeta::read_from_dir(dir.path()).is_err());
    }

    #[test]
    fn test_extension_serializes_under_compat_key() {
        let json = serde_json::to_value(sample_meta()).unwrap();
        assert!(json.get("thanos").is_some());
        assert_eq!(json["thanos"]["source"], "shipper");
    }

    #[test]
    fn test_is_block_dir() {
        let id = Ulid::new();
        assert_eq!(is_block_dir(&id.to_string()), Some(id));
        assert_eq!(is_block_dir("chunks"), None);
        assert_eq!(is_block_dir(".staging"), None);
    }
}

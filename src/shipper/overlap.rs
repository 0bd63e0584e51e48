//! Lazy remote overlap detection
//!
//! Compacted blocks must not be shipped into a time range the bucket
//! already covers for the same external label set. The checker is scoped to
//! a single sync pass: the bucket listing is scanned once on first use and
//! the collected ranges are reused for every later candidate.

use crate::block::{self, BlockMeta, META_FILENAME};
use crate::bucket::Bucket;
use crate::labels::LabelSet;
use crate::{Error, Result};

use tracing::info;
use ulid::Ulid;

/// A remote block's time coverage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct BlockRange {
    id: Ulid,
    min_time: i64,
    max_time: i64,
}

pub(crate) struct LazyOverlapChecker<'a> {
    bucket: &'a dyn Bucket,
    labels: LabelSet,
    synced: bool,
    ranges: Vec<BlockRange>,
}

impl<'a> LazyOverlapChecker<'a> {
    pub fn new(bucket: &'a dyn Bucket, labels: LabelSet) -> Self {
        Self {
            bucket,
            labels,
            synced: false,
            ranges: Vec::new(),
        }
    }

    /// Scan the bucket once, collecting time ranges of blocks whose external
    /// labels equal the shipper's configured set.
    async fn sync_ranges(&mut self) -> Result<()> {
        let mut ids = Vec::new();
        self.bucket
            .iter("", &mut |name| {
                if let Some(id) = block::is_block_dir(name.trim_end_matches('/')) {
                    ids.push(id);
                }
                Ok(())
            })
            .await
            .map_err(|e| Error::Internal(format!("list remote block metas: {e}")))?;

        for id in ids {
            let key = format!("{id}/{META_FILENAME}");
            let bytes = self
                .bucket
                .get(&key)
                .await
                .map_err(|e| Error::Internal(format!("download meta {key}: {e}")))?;
            let meta: BlockMeta = serde_json::from_slice(&bytes)
                .map_err(|e| Error::Serialization(format!("parse meta {key}: {e}")))?;

            if meta.extension.labels != self.labels {
                continue;
            }
            self.ranges.push(BlockRange {
                id: meta.ulid,
                min_time: meta.min_time,
                max_time: meta.max_time,
            });
        }

        self.synced = true;
        Ok(())
    }

    /// Whether `new_meta`'s range overlaps any remote block with matching
    /// labels. Any overlap in the merged set aborts the upload, even one not
    /// involving the candidate itself.
    pub async fn is_overlapping(&mut self, new_meta: &BlockMeta) -> Result<()> {
        if !self.synced {
            info!(block = %new_meta.ulid, "gathering existing blocks from the remote bucket for overlap check");
            self.sync_ranges().await?;
        }

        let mut merged = self.ranges.clone();
        merged.push(BlockRange {
            id: new_meta.ulid,
            min_time: new_meta.min_time,
            max_time: new_meta.max_time,
        });
        merged.sort_by_key(|r| (r.min_time, r.max_time));

        for pair in merged.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            if a.max_time > b.min_time {
                return Err(Error::BlockOverlap {
                    block: new_meta.ulid,
                    details: format!(
                        "[{}, {}) of {} intersects [{}, {}) of {}",
                        a.min_time, a.max_time, a.id, b.min_time, b.max_time, b.id
                    ),
                });
            }
        }
        Ok(())
    }
}

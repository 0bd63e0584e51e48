//! Block shipper
//!
//! Watches a local data directory for immutable blocks and uploads each one
//! exactly once to a remote bucket. The shipper is safe to run alongside a
//! compactor mutating the same directory: compaction only adds new blocks or
//! removes superseded ones, never rewrites a block id in place, and every
//! upload works on a hard-linked staging copy.
//!
//! The persisted upload log is an optimization that avoids per-block bucket
//! probes; the bucket itself stays the source of truth for idempotence.

mod overlap;
mod telemetry;
pub mod upload_log;

pub use upload_log::{UploadLog, DEFAULT_LOG_FILENAME};

use crate::block::{self, BlockMeta, CHUNKS_DIRNAME, INDEX_FILENAME, META_FILENAME};
use crate::bucket::Bucket;
use crate::labels::LabelSet;
use crate::{Error, Result};

use overlap::LazyOverlapChecker;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use ulid::Ulid;

/// Directory under the data dir holding per-upload staging copies. Not a
/// valid ULID, so block enumeration never picks it up.
const STAGING_DIRNAME: &str = ".staging";

/// Shipper configuration
#[derive(Debug, Clone)]
pub struct ShipperConfig {
    /// Also ship blocks above compaction level 1
    pub upload_compacted: bool,
    /// Tolerate per-block upload failures and skip the overlap check,
    /// letting failed blocks retry on the next sync pass
    pub allow_out_of_order_uploads: bool,
    /// Skip unreadable local blocks instead of aborting the pass
    pub skip_corrupted_blocks: bool,
    /// Source-component tag recorded in every uploaded meta document
    pub source: String,
    /// Filename of the upload log inside the data directory
    pub log_file_name: String,
}

impl Default for ShipperConfig {
    fn default() -> Self {
        Self {
            upload_compacted: false,
            allow_out_of_order_uploads: false,
            skip_corrupted_blocks: false,
            source: "shipper".to_string(),
            log_file_name: DEFAULT_LOG_FILENAME.to_string(),
        }
    }
}

/// Uploads local blocks to a remote bucket, exactly once each.
pub struct Shipper {
    dir: PathBuf,
    bucket: Arc<dyn Bucket>,
    config: ShipperConfig,
    log_path: PathBuf,
    /// External labels attached to every uploaded block
    labels: std::sync::RwLock<LabelSet>,
    /// One sync pass at a time per instance
    sync_lock: tokio::sync::Mutex<()>,
}

impl Shipper {
    /// Create a new shipper over `dir`, uploading into `bucket`.
    pub fn new(
        bucket: Arc<dyn Bucket>,
        dir: impl Into<PathBuf>,
        labels: LabelSet,
        config: ShipperConfig,
    ) -> Self {
        let dir = dir.into();
        let log_path = dir.join(&config.log_file_name);
        Self {
            dir,
            bucket,
            config,
            log_path,
            labels: std::sync::RwLock::new(labels),
            sync_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Replace the external label set used for future uploads.
    pub fn set_labels(&self, labels: LabelSet) {
        *self.labels.write().unwrap() = labels;
    }

    /// Current external label set.
    pub fn labels(&self) -> LabelSet {
        self.labels.read().unwrap().clone()
    }

    /// Block ids recorded as uploaded in the persisted log. Problems reading
    /// the log yield an empty set; [`Shipper::sync`] reports them.
    pub fn uploaded_blocks(&self) -> HashSet<Ulid> {
        match upload_log::read_log(&self.log_path) {
            Ok(log) => log.uploaded.into_iter().collect(),
            Err(_) => HashSet::new(),
        }
    }

    /// Perform a single synchronization pass, ensuring every shippable local
    /// block has been uploaded to the bucket once.
    ///
    /// Returns the number of blocks uploaded by this pass. Tolerated
    /// per-block failures surface as [`Error::SyncIncomplete`], which still
    /// carries the partial upload count.
    pub async fn sync(&self) -> Result<usize> {
        let _serialize = self.sync_lock.lock().await;

        match self.sync_pass().await {
            Ok(outcome) => {
                telemetry::record_dir_sync(false);
                telemetry::record_upload_failures(outcome.failed_uploads as u64);
                telemetry::record_corrupted_blocks(outcome.corrupted_blocks.len() as u64);
                if outcome.failed_uploads > 0 || !outcome.corrupted_blocks.is_empty() {
                    return Err(Error::SyncIncomplete {
                        uploaded: outcome.uploaded,
                        failed_uploads: outcome.failed_uploads,
                        corrupted_blocks: outcome.corrupted_blocks.len(),
                    });
                }
                Ok(outcome.uploaded)
            }
            Err(e) => {
                telemetry::record_dir_sync(true);
                Err(e)
            }
        }
    }

    async fn sync_pass(&self) -> Result<SyncOutcome> {
        let prior = match upload_log::read_log(&self.log_path) {
            Ok(log) => log,
            Err(Error::Io(e)) if e.kind() == ErrorKind::NotFound => {
                info!("no upload log found, starting with an empty one");
                UploadLog::default()
            }
            Err(e) => {
                error!(error = %e, "failed to read upload log, starting with an empty one");
                UploadLog::default()
            }
        };
        let has_uploaded: HashSet<Ulid> = prior.uploaded.iter().copied().collect();

        let (metas, corrupted_blocks) = self.block_metas_from_oldest()?;

        let mut checker = LazyOverlapChecker::new(self.bucket.as_ref(), self.labels());
        let mut new_log = UploadLog::default();
        let mut uploaded = 0usize;
        let mut failed_uploads = 0usize;

        for meta in &metas {
            // Carry forward blocks we already shipped. Logged blocks gone
            // from the bucket were removed by remote compaction and must not
            // be re-uploaded.
            if has_uploaded.contains(&meta.ulid) {
                new_log.uploaded.push(meta.ulid);
                continue;
            }

            if meta.stats.num_samples == 0 {
                debug!(block = %meta.ulid, "ignoring empty block");
                continue;
            }

            if meta.compaction.level > 1 && !self.config.upload_compacted {
                continue;
            }

            // The bucket is authoritative: an existing meta object means the
            // block is durable even if the log never recorded it.
            let meta_key = format!("{}/{META_FILENAME}", meta.ulid);
            let exists = self
                .bucket
                .exists(&meta_key)
                .await
                .map_err(|e| Error::Internal(format!("check exists {meta_key}: {e}")))?;
            if exists {
                new_log.uploaded.push(meta.ulid);
                continue;
            }

            if meta.compaction.level > 1 && !self.config.allow_out_of_order_uploads {
                checker.is_overlapping(meta).await?;
            }

            if let Err(e) = self.upload(meta).await {
                if !self.config.allow_out_of_order_uploads {
                    error!(block = %meta.ulid, error = %e, "block upload failed, aborting sync");
                    return Err(e);
                }
                // Keep going so later blocks still ship; this one retries on
                // the next pass.
                error!(block = %meta.ulid, error = %e, "shipping failed");
                failed_uploads += 1;
                continue;
            }

            new_log.uploaded.push(meta.ulid);
            uploaded += 1;
            telemetry::record_upload();
        }

        // The bucket has already been mutated, so a log write failure must
        // not fail the pass; the next one heals via bucket probes.
        if let Err(e) = upload_log::write_log(&self.log_path, &new_log) {
            warn!(error = %e, "updating upload log failed");
        }

        Ok(SyncOutcome {
            uploaded,
            failed_uploads,
            corrupted_blocks,
        })
    }

    /// Upload one block through an isolated staging directory.
    async fn upload(&self, meta: &BlockMeta) -> Result<()> {
        info!(block = %meta.ulid, "uploading new block");

        let updir = self
            .dir
            .join(STAGING_DIRNAME)
            .join("upload")
            .join(meta.ulid.to_string());
        // Leftovers from a crashed pass.
        if updir.exists() {
            fs::remove_dir_all(&updir)?;
        }
        fs::create_dir_all(&updir)?;
        let _cleanup = StagingGuard {
            path: updir.clone(),
        };

        // Hard links decouple the upload from compactor churn without
        // copying block bytes.
        let block_dir = self.dir.join(meta.ulid.to_string());
        hardlink_block(&block_dir, &updir)?;

        let mut upload_meta = meta.clone();
        for (name, value) in self.labels().iter() {
            upload_meta.extension.labels.insert(name, value);
        }
        upload_meta.extension.source = self.config.source.clone();
        upload_meta.extension.segment_files = block::segment_files(&updir)?;
        upload_meta.write_to_dir(&updir)?;

        self.bucket.upload_dir(&updir, &meta.ulid.to_string()).await
    }

    /// Metadata of every block found in the data dir, sorted by `min_time`
    /// ascending. Unreadable blocks either collect into the second return
    /// value (`skip_corrupted_blocks`) or abort the enumeration.
    fn block_metas_from_oldest(&self) -> Result<(Vec<BlockMeta>, Vec<String>)> {
        let mut metas = Vec::new();
        let mut corrupted = Vec::new();

        for entry in fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if block::is_block_dir(&name).is_none() {
                continue;
            }
            let dir = self.dir.join(&name);

            let stat = match fs::metadata(&dir) {
                Ok(stat) => stat,
                Err(e) => {
                    if self.config.skip_corrupted_blocks {
                        error!(block = %dir.display(), error = %e, "stat block");
                        corrupted.push(name);
                        continue;
                    }
                    return Err(Error::SyncBlockCorrupted {
                        blocks: vec![format!("{name}: {e}")],
                    });
                }
            };
            if !stat.is_dir() {
                continue;
            }

            match BlockMeta::read_from_dir(&dir) {
                Ok(meta) => metas.push(meta),
                Err(e) => {
                    if self.config.skip_corrupted_blocks {
                        error!(block = %dir.display(), error = %e, "read block metadata");
                        corrupted.push(name);
                        continue;
                    }
                    return Err(Error::SyncBlockCorrupted {
                        blocks: vec![format!("{name}: {e}")],
                    });
                }
            }
        }

        metas.sort_by_key(|m| m.min_time);
        Ok((metas, corrupted))
    }
}

struct SyncOutcome {
    uploaded: usize,
    failed_uploads: usize,
    corrupted_blocks: Vec<String>,
}

/// Removes the staging directory on every exit path, including future
/// cancellation mid-upload.
struct StagingGuard {
    path: PathBuf,
}

impl Drop for StagingGuard {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_dir_all(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                error!(dir = %self.path.display(), error = %e, "failed to clean upload staging directory");
            }
        }
    }
}

/// Hard-link a block's chunk files, index and meta into `dst`.
fn hardlink_block(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst.join(CHUNKS_DIRNAME))?;

    let mut files = Vec::new();
    for entry in fs::read_dir(src.join(CHUNKS_DIRNAME))? {
        let entry = entry?;
        files.push(format!(
            "{CHUNKS_DIRNAME}/{}",
            entry.file_name().to_string_lossy()
        ));
    }
    files.push(META_FILENAME.to_string());
    files.push(INDEX_FILENAME.to_string());

    for rel in files {
        fs::hard_link(src.join(&rel), dst.join(&rel))
            .map_err(|e| Error::Internal(format!("hard link file {rel}: {e}")))?;
    }
    Ok(())
}

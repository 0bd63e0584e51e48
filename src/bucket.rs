//! Object bucket contract consumed by the shipper
//!
//! The shipper only needs four operations from a bucket: lazy enumeration,
//! existence probes, small-object reads and whole-directory uploads. The
//! production implementation wraps an [`object_store::ObjectStore`]; tests
//! substitute counting or failing wrappers.

use crate::block::META_FILENAME;
use crate::{Error, Result};

use async_trait::async_trait;
use bytes::Bytes;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Callback invoked per entry by [`Bucket::iter`].
pub type IterFn<'a> = &'a mut (dyn FnMut(&str) -> Result<()> + Send);

/// Remote bucket operations the shipper depends on.
#[async_trait]
pub trait Bucket: Send + Sync + std::fmt::Debug {
    /// Enumerate the top-level entries under `prefix`, invoking `f` once per
    /// entry. Directory-like entries carry a trailing `/`.
    async fn iter(&self, prefix: &str, f: IterFn<'_>) -> Result<()>;

    /// Whether an object exists at `key`.
    async fn exists(&self, key: &str) -> Result<bool>;

    /// Read the full object at `key`.
    async fn get(&self, key: &str) -> Result<Bytes>;

    /// Upload every file under `src` to `dst_prefix`, preserving relative
    /// paths. The meta document is written last so a half-finished upload is
    /// never observable through [`Bucket::exists`] on the meta key.
    async fn upload_dir(&self, src: &Path, dst_prefix: &str) -> Result<()>;
}

/// [`Bucket`] implementation over any `object_store` backend.
#[derive(Debug)]
pub struct ObjectStoreBucket {
    store: Arc<dyn ObjectStore>,
}

impl ObjectStoreBucket {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    fn object_path(key: &str) -> ObjectPath {
        ObjectPath::from(key)
    }
}

#[async_trait]
impl Bucket for ObjectStoreBucket {
    async fn iter(&self, prefix: &str, f: IterFn<'_>) -> Result<()> {
        let prefix_path = (!prefix.is_empty()).then(|| Self::object_path(prefix));
        let listing = self.store.list_with_delimiter(prefix_path.as_ref()).await?;
        for dir in listing.common_prefixes {
            let name = dir.filename().unwrap_or_default();
            f(&format!("{name}/"))?;
        }
        for obj in listing.objects {
            let name = obj.location.filename().unwrap_or_default();
            f(name)?;
        }
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self.store.head(&Self::object_path(key)).await {
            Ok(_) => Ok(true),
            Err(object_store::Error::NotFound { .. }) => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, key: &str) -> Result<Bytes> {
        Ok(self.store.get(&Self::object_path(key)).await?.bytes().await?)
    }

    async fn upload_dir(&self, src: &Path, dst_prefix: &str) -> Result<()> {
        let mut files = collect_files(src)?;
        // Meta goes last: its presence marks the upload complete.
        files.sort();
        files.retain(|rel| rel != META_FILENAME);
        files.push(META_FILENAME.to_string());

        for rel in files {
            let local = src.join(&rel);
            if rel == META_FILENAME && !local.exists() {
                return Err(Error::Internal(format!(
                    "upload dir {} has no {META_FILENAME}",
                    src.display()
                )));
            }
            let data = tokio::fs::read(&local).await?;
            let key = Self::object_path(&format!("{dst_prefix}/{rel}"));
            debug!(key = %key, bytes = data.len(), "uploading object");
            self.store.put(&key, PutPayload::from(data)).await?;
        }
        Ok(())
    }
}

/// Relative paths of all regular files under `root`, depth-first.
fn collect_files(root: &Path) -> Result<Vec<String>> {
    fn walk(root: &Path, dir: &Path, out: &mut Vec<String>) -> Result<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path: PathBuf = entry.path();
            if path.is_dir() {
                walk(root, &path, out)?;
            } else {
                let rel = path
                    .strip_prefix(root)
                    .map_err(|e| Error::Internal(format!("strip prefix: {e}")))?;
                out.push(rel.to_string_lossy().replace('\\', "/"));
            }
        }
        Ok(())
    }

    let mut out = Vec::new();
    walk(root, root, &mut out)?;
    Ok(out)
}

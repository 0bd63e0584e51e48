//! Bucket factory for environment-based configuration
//!
//! Binaries pick the shipper's remote bucket backend through environment
//! variables, so development (in-memory) and production (S3) wiring stays
//! out of the code.

use crate::bucket::{Bucket, ObjectStoreBucket};
use crate::{Error, Result};
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::ObjectStore;
use std::sync::Arc;
use tracing::info;

/// Remote bucket backend selected through `STORAGE_BACKEND`.
#[derive(Debug, Clone, PartialEq, Eq)]
enum BucketBackend {
    /// In-memory bucket for development and tests
    Memory,
    /// S3 or any S3-compatible endpoint (MinIO, LocalStack)
    S3 {
        bucket: String,
        region: String,
        endpoint: Option<String>,
    },
}

impl BucketBackend {
    fn from_env() -> Result<Self> {
        let backend = std::env::var("STORAGE_BACKEND").unwrap_or_else(|_| "memory".to_string());
        match backend.as_str() {
            "memory" => Ok(Self::Memory),
            "s3" => {
                let bucket = std::env::var("S3_BUCKET").map_err(|_| {
                    Error::Config("S3_BUCKET required when STORAGE_BACKEND=s3".to_string())
                })?;
                Ok(Self::S3 {
                    bucket,
                    region: std::env::var("S3_REGION")
                        .unwrap_or_else(|_| "us-east-1".to_string()),
                    endpoint: std::env::var("S3_ENDPOINT").ok(),
                })
            }
            other => Err(Error::Config(format!(
                "Unknown STORAGE_BACKEND: {other}. Use 'memory' or 's3'"
            ))),
        }
    }

    fn build(self) -> Result<Arc<dyn ObjectStore>> {
        match self {
            Self::Memory => {
                info!("Shipping into an in-memory bucket (development mode)");
                Ok(Arc::new(InMemory::new()))
            }
            Self::S3 {
                bucket,
                region,
                endpoint,
            } => {
                info!(bucket = %bucket, region = %region, "Shipping into S3 bucket");
                // from_env picks up AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY;
                // without them the IAM role applies.
                let mut builder = AmazonS3Builder::from_env()
                    .with_bucket_name(&bucket)
                    .with_region(&region);
                if let Some(endpoint) = endpoint {
                    info!(endpoint = %endpoint, "Using custom S3 endpoint");
                    builder = builder.with_endpoint(&endpoint).with_allow_http(true);
                }
                Ok(Arc::new(builder.build()?))
            }
        }
    }
}

pub struct ComponentFactory;

impl ComponentFactory {
    /// Create the shipper's remote bucket from environment
    ///
    /// Environment variables:
    /// - STORAGE_BACKEND: "memory" (default) or "s3"
    /// - S3_BUCKET: bucket name (required for s3)
    /// - S3_REGION: region (default: us-east-1)
    /// - S3_ENDPOINT: custom endpoint for S3-compatible stores (optional)
    /// - AWS_ACCESS_KEY_ID / AWS_SECRET_ACCESS_KEY: credentials (optional,
    ///   IAM role if not set)
    pub fn create_bucket() -> Result<Arc<dyn Bucket>> {
        let store = BucketBackend::from_env()?.build()?;
        Ok(Arc::new(ObjectStoreBucket::new(store)))
    }
}

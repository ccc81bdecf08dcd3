//! Workload payload cache.
//!
//! Pulls a claimed artifact out of the remote object store, verifies its
//! SHA-256 against the claim, and stages the bytes in the node-local cache
//! bucket keyed by the claim subject. Runs entirely before a VM is consumed,
//! so every failure here leaves the pool untouched.

use std::sync::Arc;

use bytes::Bytes;
use sha2::{Digest, Sha256};
use tracing::{error, info};
use url::Url;
use uuid::Uuid;

use crate::bus::{Bus, BusError};
use crate::claims::WorkloadClaims;
use crate::error::NodeError;

/// Well-known internal cache bucket the agents read from.
pub const WORKLOAD_CACHE_BUCKET: &str = "NEXCACHE";

pub struct PayloadCache {
    remote: Arc<dyn Bus>,
    internal: Arc<dyn Bus>,
    staging_dir: std::path::PathBuf,
}

impl PayloadCache {
    pub fn new(remote: Arc<dyn Bus>, internal: Arc<dyn Bus>) -> Self {
        Self::with_staging_dir(remote, internal, std::env::temp_dir())
    }

    /// Cache staging into a specific directory instead of the OS temp dir.
    pub fn with_staging_dir(
        remote: Arc<dyn Bus>,
        internal: Arc<dyn Bus>,
        staging_dir: std::path::PathBuf,
    ) -> Self {
        Self {
            remote,
            internal,
            staging_dir,
        }
    }

    /// Materialise the artifact named by a verified claim.
    ///
    /// Returns `(size_bytes, hex_sha256)` once the bytes are stored in the
    /// internal cache under the claim subject.
    pub async fn cache_workload(
        &self,
        claims: &WorkloadClaims,
        js_domain: Option<&str>,
    ) -> Result<(u64, String), NodeError> {
        let location = Url::parse(&claims.location)
            .map_err(|e| NodeError::Decode(format!("invalid workload location: {e}")))?;
        let bucket = location
            .host_str()
            .ok_or_else(|| NodeError::Decode("workload location has no bucket".to_string()))?;
        let key = location.path().trim_matches('/').to_string();

        info!(bucket = %bucket, key = %key, "Attempting object store download");

        self.remote
            .object_info(bucket, &key, js_domain)
            .await
            .map_err(pull_error)?;

        let fetched = self
            .remote
            .object_get(bucket, &key, js_domain)
            .await
            .map_err(pull_error)?;

        // Stage through a uniquely-named temp file; the read-back is what we
        // hash and cache. The staging file is removed on every path.
        let staging = self.staging_dir.join(Uuid::new_v4().to_string());
        tokio::fs::write(&staging, &fetched)
            .await
            .map_err(|e| NodeError::Storage(format!("failed to stage workload: {e}")))?;

        let read_back = tokio::fs::read(&staging).await;
        if let Err(err) = tokio::fs::remove_file(&staging).await {
            error!(path = %staging.display(), error = %err, "Failed to remove staging file");
        }
        let workload =
            read_back.map_err(|e| NodeError::Storage(format!("failed to read staged workload: {e}")))?;

        let computed = hex::encode(Sha256::digest(&workload));
        if computed != claims.hash {
            return Err(NodeError::HashMismatch {
                expected: claims.hash.clone(),
                computed,
            });
        }

        let size = self
            .internal
            .object_put(WORKLOAD_CACHE_BUCKET, &claims.subject, Bytes::from(workload))
            .await
            .map_err(|e| NodeError::Storage(e.to_string()))?;

        info!(
            name = %claims.subject,
            bytes = size,
            "Successfully stored workload in internal object store"
        );

        Ok((size, computed))
    }
}

fn pull_error(err: BusError) -> NodeError {
    match err {
        BusError::NotFound { bucket, key } => NodeError::CachePull(format!(
            "workload binary not found in source object store: {bucket}/{key}"
        )),
        BusError::Auth(reason) => {
            NodeError::CachePull(format!("source object store rejected credentials: {reason}"))
        }
        other => NodeError::CachePull(other.to_string()),
    }
}

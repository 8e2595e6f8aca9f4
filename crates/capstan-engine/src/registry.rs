//! Persistence of deployed-runtime identifiers.
//!
//! A deployed runtime is represented by exactly one object: the raw batch job
//! identifier of its worker pool, stored under a key derived from the runtime
//! name and the crate version. The object is written once on deploy, read on
//! invoke/stop/list, and deleted on stop/clean; there is a single writer per
//! runtime by construction.

use std::sync::Arc;

use sha2::Digest as _;
use sha2::Sha256;
use tracing::debug;

use crate::Result;
use crate::VERSION;
use crate::storage::ObjectStore;

/// The storage prefix under which runtime records live.
pub const RUNTIMES_PREFIX: &str = "runtimes";

/// The backend name embedded in runtime keys.
const BACKEND_NAME: &str = "hpc";

/// The number of digest characters kept in a runtime key.
const KEY_DIGEST_LEN: usize = 10;

/// Reads and writes deployed-runtime records through the object store.
#[derive(Clone)]
pub struct RuntimeRegistry {
    /// The backing object store.
    store: Arc<dyn ObjectStore>,
}

impl RuntimeRegistry {
    /// Constructs a registry over the given store.
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Computes the key that uniquely identifies a runtime in storage.
    ///
    /// The key changes with the crate version so runtimes deployed by an
    /// older release are never mistaken for current ones.
    pub fn runtime_key(name: &str) -> String {
        let digest = Sha256::digest(format!("{name}-{VERSION}"));
        let tag: String = hex::encode(digest).chars().take(KEY_DIGEST_LEN).collect();

        format!(
            "{BACKEND_NAME}/{VERSION}/{BACKEND_NAME}-runtime-{version}-{tag}",
            version = VERSION.replace('.', "")
        )
    }

    /// Resolves the object key holding a runtime's job id.
    fn object_key(name: &str) -> String {
        format!("{RUNTIMES_PREFIX}/{key}.jid", key = Self::runtime_key(name))
    }

    /// Persists the batch job identifier of a deployed runtime.
    pub async fn save_job_id(&self, runtime: &str, job_id: &str) -> Result<()> {
        let key = Self::object_key(runtime);
        debug!("persisting job id `{job_id}` at `{key}`");
        self.store.put(&key, job_id.as_bytes()).await
    }

    /// Loads the batch job identifier of a deployed runtime, if any.
    pub async fn load_job_id(&self, runtime: &str) -> Result<Option<String>> {
        let Some(body) = self.store.get(&Self::object_key(runtime)).await? else {
            debug!("no persisted job id for runtime `{runtime}`");
            return Ok(None);
        };

        Ok(Some(String::from_utf8_lossy(&body).trim().to_string()))
    }

    /// Deletes a runtime's persisted job identifier.
    pub async fn delete_job_id(&self, runtime: &str) -> Result<()> {
        self.store.delete(&Self::object_key(runtime)).await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::storage::FsObjectStore;

    #[test]
    fn keys_distinguish_runtimes() {
        let a = RuntimeRegistry::runtime_key("cpu-small");
        let b = RuntimeRegistry::runtime_key("gpu-large");
        assert_ne!(a, b);
        assert!(a.starts_with("hpc/"));
        assert_eq!(a, RuntimeRegistry::runtime_key("cpu-small"));
    }

    #[tokio::test]
    async fn job_ids_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let registry = RuntimeRegistry::new(Arc::new(FsObjectStore::new(dir.path())));

        assert_eq!(registry.load_job_id("cpu-small").await.unwrap(), None);

        registry.save_job_id("cpu-small", "48213").await.unwrap();
        assert_eq!(
            registry.load_job_id("cpu-small").await.unwrap().as_deref(),
            Some("48213")
        );

        registry.delete_job_id("cpu-small").await.unwrap();
        assert_eq!(registry.load_job_id("cpu-small").await.unwrap(), None);
    }
}

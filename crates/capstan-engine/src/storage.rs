//! The object storage seam used to persist deployed-runtime state.

use std::io;
use std::path::PathBuf;

use async_trait::async_trait;
use tokio::fs;
use tracing::trace;

use crate::Error;
use crate::Result;

/// A narrow object store: put, get, delete.
///
/// The engine persists only tiny control-plane objects through this seam; the
/// data plane (function inputs and results) belongs to the client-side
/// executor and never passes through here.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Stores an object, replacing any previous body.
    async fn put(&self, key: &str, body: &[u8]) -> Result<()>;

    /// Fetches an object's body.
    ///
    /// Returns `None` when the key does not exist; transport failures are
    /// errors.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Deletes an object. Deleting a missing key succeeds.
    async fn delete(&self, key: &str) -> Result<()>;
}

/// An object store rooted at a directory of the cluster's shared filesystem.
///
/// Keys use `/` separators and map directly onto paths below the root.
#[derive(Debug, Clone)]
pub struct FsObjectStore {
    /// The directory all keys resolve under.
    root: PathBuf,
}

impl FsObjectStore {
    /// Constructs a store rooted at the given directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolves a key to its path below the root.
    fn object_path(&self, key: &str) -> PathBuf {
        key.split('/').fold(self.root.clone(), |path, part| path.join(part))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn put(&self, key: &str, body: &[u8]) -> Result<()> {
        let path = self.object_path(key);
        trace!("storing object at `{path}`", path = path.display());

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await.map_err(Error::Io)?;
        }

        fs::write(&path, body).await.map_err(Error::Io)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        match fs::read(self.object_path(key)).await {
            Ok(body) => Ok(Some(body)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(Error::Io(e)),
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.object_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[tokio::test]
    async fn objects_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("runtimes/a/b.jid", b"48213").await.unwrap();
        assert_eq!(
            store.get("runtimes/a/b.jid").await.unwrap().as_deref(),
            Some(b"48213".as_slice())
        );

        store.delete("runtimes/a/b.jid").await.unwrap();
        assert_eq!(store.get("runtimes/a/b.jid").await.unwrap(), None);
    }

    #[tokio::test]
    async fn missing_keys_read_as_none_and_delete_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        assert_eq!(store.get("nope").await.unwrap(), None);
        store.delete("nope").await.unwrap();
    }

    #[tokio::test]
    async fn puts_replace_previous_bodies() {
        let dir = tempfile::tempdir().unwrap();
        let store = FsObjectStore::new(dir.path());

        store.put("key", b"first").await.unwrap();
        store.put("key", b"second").await.unwrap();
        assert_eq!(
            store.get("key").await.unwrap().as_deref(),
            Some(b"second".as_slice())
        );
    }
}

// Workspace blob storage, sharing the workspace's store file.
//
// Content-addressed keys are the url-safe base64 of the SHA-256 digest, so
// identical payloads collapse to one row and keys are filesystem/URL safe.

use std::sync::Arc;

use anyhow::Result;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use sha2::{Digest, Sha256};

use crate::store::db::DocDb;

/// Derive the content-addressed key for a blob payload.
pub fn blob_key_for(content: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(content))
}

/// Blob access for one workspace store.
pub struct BlobStore {
    db: Arc<DocDb>,
}

impl BlobStore {
    pub fn new(db: Arc<DocDb>) -> Self {
        Self { db }
    }

    pub fn connect(&self) -> Result<()> {
        self.db.connect()
    }

    pub fn disconnect(&self) {
        self.db.close();
    }

    /// Store a blob under an explicit key (preserves keys when copying
    /// between workspaces).
    pub fn put(&self, key: &str, data: &[u8]) -> Result<()> {
        self.db.put_blob(key, data)
    }

    /// Store a blob under its content-addressed key and return the key.
    pub fn put_hashed(&self, data: &[u8]) -> Result<String> {
        let key = blob_key_for(data);
        self.db.put_blob(&key, data)?;
        Ok(key)
    }

    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.db.get_blob(key)
    }

    pub fn keys(&self) -> Result<Vec<String>> {
        self.db.blob_keys()
    }

    pub fn delete(&self, key: &str) -> Result<bool> {
        self.db.delete_blob(key)
    }
}

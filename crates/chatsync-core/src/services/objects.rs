use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::ObjectStorage;
use crate::error::{ChatError, ChatResult};
use crate::storage::Storage;

/// URI scheme of blobs stored by [`BlobObjectStorage`]
pub const BLOB_URI_SCHEME: &str = "blob://";

enum Blobs {
    Memory(Mutex<HashMap<String, (Vec<u8>, String)>>),
    Persistent(Storage),
}

/// Content-addressed object storage.
///
/// Uploads are keyed by their BLAKE3 hash and addressed as
/// `blob://<hash>`; uploading the same bytes twice yields the same URI.
pub struct BlobObjectStorage {
    blobs: Blobs,
    max_bytes: usize,
    failing_uploads: AtomicU32,
}

impl BlobObjectStorage {
    pub fn in_memory(max_bytes: usize) -> Self {
        Self {
            blobs: Blobs::Memory(Mutex::new(HashMap::new())),
            max_bytes,
            failing_uploads: AtomicU32::new(0),
        }
    }

    pub fn open(storage: Storage, max_bytes: usize) -> Self {
        Self {
            blobs: Blobs::Persistent(storage),
            max_bytes,
            failing_uploads: AtomicU32::new(0),
        }
    }

    /// Make the next `count` uploads fail (test hook).
    pub fn fail_next_uploads(&self, count: u32) {
        self.failing_uploads.store(count, Ordering::SeqCst);
    }

    /// Fetch a blob and its content type by URI.
    pub fn fetch(&self, uri: &str) -> ChatResult<Option<(Vec<u8>, String)>> {
        let Some(hash) = uri.strip_prefix(BLOB_URI_SCHEME) else {
            return Ok(None);
        };
        match &self.blobs {
            Blobs::Memory(map) => Ok(map.lock().get(hash).cloned()),
            Blobs::Persistent(storage) => storage.load_blob(hash),
        }
    }

    /// Whether `uri` refers to a stored blob
    pub fn contains(&self, uri: &str) -> bool {
        matches!(self.fetch(uri), Ok(Some(_)))
    }
}

#[async_trait]
impl ObjectStorage for BlobObjectStorage {
    async fn upload(&self, bytes: Vec<u8>, content_type: &str, name: &str) -> ChatResult<String> {
        let injected = self
            .failing_uploads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            warn!(name, "Injected upload failure");
            return Err(ChatError::UploadFailed(format!("{}: network error", name)));
        }
        if bytes.len() > self.max_bytes {
            return Err(ChatError::UploadFailed(format!(
                "{} is {} bytes, quota is {} bytes",
                name,
                bytes.len(),
                self.max_bytes
            )));
        }

        let hash = match &self.blobs {
            Blobs::Memory(map) => {
                let hash = blake3::hash(&bytes).to_hex().to_string();
                map.lock()
                    .entry(hash.clone())
                    .or_insert_with(|| (bytes, content_type.to_string()));
                hash
            }
            Blobs::Persistent(storage) => storage
                .save_blob(&bytes, content_type)
                .map_err(|e| ChatError::UploadFailed(e.to_string()))?,
        };
        debug!(name, %hash, "Blob stored");
        Ok(format!("{}{}", BLOB_URI_SCHEME, hash))
    }
}

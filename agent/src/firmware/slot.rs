//! Update slot: the inactive firmware region an image is staged into

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sysinfo::Disks;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::errors::AgentError;
use crate::filesys::dir::Dir;
use crate::filesys::file::File;
use crate::utils::sha256_hex;

/// Persistent update-slot capability.
///
/// Lifecycle: `begin` → `write`* → `end` (commit) or `abort`. Only a
/// successful `end` makes an image the next boot image.
#[async_trait]
pub trait UpdateSlot: Send {
    /// Prepare the slot for an image of `expected_size` bytes. Fails when the
    /// image cannot fit.
    async fn begin(&mut self, expected_size: u64) -> Result<(), AgentError>;

    /// Append a chunk; returns the number of bytes accepted
    async fn write(&mut self, chunk: &[u8]) -> Result<usize, AgentError>;

    /// Commit the staged image as the next boot image
    async fn end(&mut self) -> Result<(), AgentError>;

    /// Whether the committed image is complete and intact
    async fn is_finished(&self) -> bool;

    /// Discard the staged image. Never touches a committed image.
    async fn abort(&mut self);

    /// Drop a committed image that failed verification, so it is never
    /// booted. The running image is not affected.
    async fn discard_committed(&mut self);
}

/// Metadata stored next to a committed image
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotManifest {
    pub size: u64,
    pub sha256: String,
    pub committed_at: DateTime<Utc>,
}

struct Staging {
    file: fs::File,
    expected: u64,
    written: u64,
    hasher: Sha256,
}

/// Update slot backed by a directory:
/// `staging.bin` while writing, `next.bin` + `next.json` once committed
pub struct FileSlot {
    dir: Dir,
    capacity: Option<u64>,
    staging: Option<Staging>,
}

impl FileSlot {
    pub fn new(dir: impl Into<PathBuf>, capacity: Option<u64>) -> Self {
        Self {
            dir: Dir::new(dir),
            capacity,
            staging: None,
        }
    }

    fn staging_path(&self) -> PathBuf {
        self.dir.path().join("staging.bin")
    }

    /// Committed image
    pub fn image_file(&self) -> File {
        self.dir.file("next.bin")
    }

    /// Manifest of the committed image
    pub fn manifest_file(&self) -> File {
        self.dir.file("next.json")
    }

    /// Manifest of the committed image, if any
    pub async fn committed(&self) -> Option<SlotManifest> {
        self.manifest_file().read_json().await.ok()
    }

    fn check_capacity(&self, expected_size: u64) -> Result<(), AgentError> {
        if let Some(capacity) = self.capacity {
            if expected_size > capacity {
                return Err(AgentError::StorageError(format!(
                    "image of {} bytes exceeds slot capacity of {} bytes",
                    expected_size, capacity
                )));
            }
        }

        if let Some(available) = available_space(self.dir.path()) {
            if expected_size > available {
                return Err(AgentError::StorageError(format!(
                    "image of {} bytes exceeds {} bytes available",
                    expected_size, available
                )));
            }
        }

        Ok(())
    }

    async fn discard_staging(&mut self) {
        if self.staging.take().is_some() {
            let path = self.staging_path();
            if let Err(e) = fs::remove_file(&path).await {
                warn!("Failed to remove staged image {:?}: {}", path, e);
            }
        }
    }
}

/// Free bytes on the disk holding `path`, if it can be determined
fn available_space(path: &Path) -> Option<u64> {
    let path = std::fs::canonicalize(path).ok()?;
    let disks = Disks::new_with_refreshed_list();
    disks
        .iter()
        .filter(|disk| path.starts_with(disk.mount_point()))
        .max_by_key(|disk| disk.mount_point().as_os_str().len())
        .map(|disk| disk.available_space())
}

async fn remove_if_exists(path: &Path) -> Result<(), AgentError> {
    match fs::remove_file(path).await {
        Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

async fn hash_file(path: &Path) -> Result<(u64, String), AgentError> {
    let mut file = fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    let mut size = 0u64;
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        size += n as u64;
    }
    Ok((size, sha256_hex(hasher)))
}

#[async_trait]
impl UpdateSlot for FileSlot {
    async fn begin(&mut self, expected_size: u64) -> Result<(), AgentError> {
        self.discard_staging().await;
        self.dir.create().await?;
        self.check_capacity(expected_size)?;

        let file = fs::File::create(self.staging_path()).await?;
        self.staging = Some(Staging {
            file,
            expected: expected_size,
            written: 0,
            hasher: Sha256::new(),
        });
        debug!("Update slot opened for {} bytes", expected_size);
        Ok(())
    }

    async fn write(&mut self, chunk: &[u8]) -> Result<usize, AgentError> {
        let staging = self
            .staging
            .as_mut()
            .ok_or_else(|| AgentError::StorageError("update slot is not open".to_string()))?;

        staging.file.write_all(chunk).await?;
        staging.hasher.update(chunk);
        staging.written += chunk.len() as u64;
        Ok(chunk.len())
    }

    async fn end(&mut self) -> Result<(), AgentError> {
        let Some(mut staging) = self.staging.take() else {
            return Err(AgentError::StorageError("update slot is not open".to_string()));
        };

        if staging.written != staging.expected {
            let _ = fs::remove_file(self.staging_path()).await;
            return Err(AgentError::StorageError(format!(
                "refusing to commit {}/{} bytes",
                staging.written, staging.expected
            )));
        }

        staging.file.flush().await?;
        staging.file.sync_all().await?;
        drop(staging.file);

        let manifest = SlotManifest {
            size: staging.written,
            sha256: sha256_hex(staging.hasher),
            committed_at: Utc::now(),
        };

        // Stale manifest out, image in, new manifest last: `is_finished`
        // only passes once the manifest describing this image is in place
        remove_if_exists(self.manifest_file().path()).await?;
        if let Err(e) = fs::rename(self.staging_path(), self.image_file().path()).await {
            let _ = fs::remove_file(self.staging_path()).await;
            return Err(e.into());
        }
        let manifest_bytes = serde_json::to_vec_pretty(&manifest)?;
        if let Err(e) = self.manifest_file().write_atomic(&manifest_bytes).await {
            let _ = fs::remove_file(self.image_file().path()).await;
            return Err(e);
        }

        info!(
            "Committed {} byte image (sha256 {})",
            manifest.size, manifest.sha256
        );
        Ok(())
    }

    async fn is_finished(&self) -> bool {
        let Some(manifest) = self.committed().await else {
            return false;
        };
        match hash_file(self.image_file().path()).await {
            Ok((size, sha256)) => size == manifest.size && sha256 == manifest.sha256,
            Err(e) => {
                warn!("Failed to read committed image: {}", e);
                false
            }
        }
    }

    async fn abort(&mut self) {
        self.discard_staging().await;
    }

    async fn discard_committed(&mut self) {
        for file in [self.manifest_file(), self.image_file()] {
            if let Err(e) = remove_if_exists(file.path()).await {
                warn!("Failed to remove unverified image file {:?}: {}", file.path(), e);
            }
        }
    }
}

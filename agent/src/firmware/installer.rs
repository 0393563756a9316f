//! Firmware installer: streams an image into the update slot, verifies it and
//! commits it

use std::time::Duration;

use futures::StreamExt;
use sha2::{Digest, Sha256};
use tracing::{debug, error, info, warn};

use crate::errors::InstallError;
use crate::firmware::slot::UpdateSlot;
use crate::http::client::ByteStream;
use crate::utils::sha256_hex;

/// Marker carried by a successful install: the device must restart to boot
/// the committed image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartRequired;

/// Result of a successful install
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Installed {
    pub size: u64,
    pub sha256: String,
    pub restart: RestartRequired,
}

/// Installer options
#[derive(Debug, Clone)]
pub struct Options {
    /// Abandon a transfer that delivers no data for this long
    pub stall_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            stall_timeout: Duration::from_secs(60),
        }
    }
}

/// Exclusive owner of the update slot
pub struct FirmwareInstaller {
    slot: Box<dyn UpdateSlot>,
    options: Options,
}

impl FirmwareInstaller {
    pub fn new(slot: Box<dyn UpdateSlot>, options: Options) -> Self {
        Self { slot, options }
    }

    /// Stream `source` into the update slot and commit it.
    ///
    /// Nothing is committed unless exactly `expected_size` bytes arrived and,
    /// when given, their sha256 matches `expected_sha256`. Every failure path
    /// discards the staged image.
    pub async fn install(
        &mut self,
        mut source: ByteStream,
        expected_size: u64,
        expected_sha256: Option<&str>,
    ) -> Result<Installed, InstallError> {
        self.slot
            .begin(expected_size)
            .await
            .map_err(|e| InstallError::InsufficientSpace {
                expected: expected_size,
                reason: e.to_string(),
            })?;

        info!("Writing {} byte firmware image...", expected_size);

        let mut hasher = Sha256::new();
        let mut written = 0u64;
        let mut next_report = expected_size / 10;

        loop {
            let chunk = match tokio::time::timeout(self.options.stall_timeout, source.next()).await
            {
                Err(_) => {
                    return self
                        .fail(InstallError::Transfer(format!(
                            "no data for {:?} after {}/{} bytes",
                            self.options.stall_timeout, written, expected_size
                        )))
                        .await;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    warn!("Firmware transfer interrupted: {}", e);
                    break;
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            if written + chunk.len() as u64 > expected_size {
                return self
                    .fail(InstallError::Transfer(format!(
                        "transfer exceeded the declared {} bytes",
                        expected_size
                    )))
                    .await;
            }

            let accepted = match self.slot.write(&chunk).await {
                Ok(n) => n.min(chunk.len()),
                Err(e) => {
                    warn!("Update slot write failed: {}", e);
                    break;
                }
            };
            hasher.update(&chunk[..accepted]);
            written += accepted as u64;
            if accepted < chunk.len() {
                warn!("Update slot accepted {}/{} bytes of a chunk", accepted, chunk.len());
                break;
            }

            if written >= next_report && expected_size > 0 {
                debug!(
                    "Firmware progress: {}% ({}/{})",
                    written * 100 / expected_size,
                    written,
                    expected_size
                );
                next_report = written + expected_size / 10;
            }
        }

        if written != expected_size {
            return self
                .fail(InstallError::IncompleteWrite {
                    written,
                    expected: expected_size,
                })
                .await;
        }

        let sha256 = sha256_hex(hasher);
        if let Some(expected) = expected_sha256 {
            if !expected.eq_ignore_ascii_case(&sha256) {
                return self
                    .fail(InstallError::VerificationFailed(format!(
                        "sha256 {} does not match expected {}",
                        sha256, expected
                    )))
                    .await;
            }
        }

        info!("Firmware written, committing...");
        if let Err(e) = self.slot.end().await {
            return self.fail(InstallError::CommitFailed(e.to_string())).await;
        }

        if !self.slot.is_finished().await {
            let err = InstallError::VerificationFailed(
                "committed image did not verify as complete".to_string(),
            );
            error!("{}", err);
            self.slot.discard_committed().await;
            return Err(err);
        }

        info!("Firmware update complete ({} bytes)", written);
        Ok(Installed {
            size: written,
            sha256,
            restart: RestartRequired,
        })
    }

    async fn fail(&mut self, err: InstallError) -> Result<Installed, InstallError> {
        error!("Firmware install failed: {}", err);
        self.slot.abort().await;
        Err(err)
    }
}

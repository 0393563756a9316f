//! Update checker: polls the version descriptor and installs newer firmware

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::errors::{InstallError, UpdateError};
use crate::firmware::installer::{FirmwareInstaller, Installed};
use crate::http::client::HttpFetch;
use crate::update::descriptor::{resolve_firmware_url, VersionDescriptor};
use crate::version::VersionOrdering;

/// Result of one check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CheckOutcome {
    /// The advertised version is not newer than the running one
    UpToDate { latest: String },
    Installed(Installed),
}

/// Checker options
#[derive(Debug, Clone)]
pub struct Options {
    /// HTTP base URL of the update server
    pub api_url: String,

    /// Version of the running firmware
    pub current_version: String,

    pub ordering: VersionOrdering,
}

pub struct UpdateChecker {
    http: Arc<dyn HttpFetch>,
    options: Options,
}

impl UpdateChecker {
    pub fn new(http: Arc<dyn HttpFetch>, options: Options) -> Self {
        Self { http, options }
    }

    pub fn current_version(&self) -> &str {
        &self.options.current_version
    }

    pub fn version_url(&self) -> String {
        format!("{}/version.json", self.options.api_url.trim_end_matches('/'))
    }

    /// Fetch the version descriptor. No retries; that is the caller's policy.
    pub async fn fetch_descriptor(&self) -> Result<VersionDescriptor, UpdateError> {
        let response = self.http.get(&self.version_url()).await?;
        if !response.is_success() {
            return Err(UpdateError::HttpFailure(response.status));
        }
        let body = response.bytes().await?;
        VersionDescriptor::parse(&body)
    }

    /// One pass: fetch, compare, and install when the advertised version is
    /// newer. Every failure leaves the running firmware in place.
    pub async fn check_for_update(
        &self,
        installer: &mut FirmwareInstaller,
    ) -> Result<CheckOutcome, UpdateError> {
        info!("Checking for updates...");

        let descriptor = self.fetch_descriptor().await.inspect_err(|e| {
            error!("Failed to fetch version descriptor: {}", e);
        })?;

        if !self
            .options
            .ordering
            .is_newer(&descriptor.version, &self.options.current_version)
        {
            info!(
                "Firmware is up to date ({} >= {})",
                self.options.current_version, descriptor.version
            );
            return Ok(CheckOutcome::UpToDate {
                latest: descriptor.version,
            });
        }

        info!(
            "New version found: {} (running {}), updating...",
            descriptor.version, self.options.current_version
        );
        let installed = self
            .install_from(&descriptor.url, descriptor.sha256.as_deref(), installer)
            .await?;
        Ok(CheckOutcome::Installed(installed))
    }

    /// Download the firmware named by `reference` and install it, with no
    /// version comparison.
    pub async fn install_from(
        &self,
        reference: &str,
        expected_sha256: Option<&str>,
        installer: &mut FirmwareInstaller,
    ) -> Result<Installed, UpdateError> {
        let url = resolve_firmware_url(&self.options.api_url, reference)?;
        info!("Downloading firmware from {}", url);

        let response = self.http.get(url.as_str()).await.inspect_err(|e| {
            error!("Firmware download failed: {}", e);
        })?;

        if !response.is_success() {
            error!("Firmware download failed: HTTP {}", response.status);
            return Err(UpdateError::HttpFailure(response.status));
        }

        let Some(size) = response.content_length.filter(|len| *len > 0) else {
            warn!("Firmware response did not declare a content length");
            return Err(InstallError::UnknownSize.into());
        };

        Ok(installer
            .install(response.body, size, expected_sha256)
            .await?)
    }
}

//! Version descriptor published at `{api_url}/version.json`

use serde::{Deserialize, Serialize};
use url::Url;

use crate::errors::UpdateError;

/// Latest available firmware
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VersionDescriptor {
    pub version: String,

    /// Firmware reference: an absolute URL or a name under `{api_url}/firmware/`
    pub url: String,

    /// Optional hex sha256 of the image
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl VersionDescriptor {
    pub fn parse(body: &[u8]) -> Result<Self, UpdateError> {
        serde_json::from_slice(body).map_err(|e| UpdateError::ParseError(e.to_string()))
    }
}

/// Resolve a firmware reference to a download URL.
///
/// Absolute `http`/`https` URLs are used as-is; anything else names an image
/// under `{api_url}/firmware/`.
pub fn resolve_firmware_url(api_url: &str, reference: &str) -> Result<Url, UpdateError> {
    let reference = reference.trim();
    if reference.is_empty() {
        return Err(UpdateError::InvalidUrl("empty firmware reference".to_string()));
    }

    if let Ok(url) = Url::parse(reference) {
        if matches!(url.scheme(), "http" | "https") {
            return Ok(url);
        }
    }

    let joined = format!("{}/firmware/{}", api_url.trim_end_matches('/'), reference);
    Url::parse(&joined).map_err(|e| UpdateError::InvalidUrl(format!("{}: {}", joined, e)))
}

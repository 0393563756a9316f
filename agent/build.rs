//! Build script for fwagent
//!
//! Stamps the image with the firmware version it reports to the update
//! server and the control plane, plus the source revision and build time
//! shown by `--version`. Release pipelines set `FWAGENT_FIRMWARE_VERSION`
//! so the advertised version tracks the firmware image rather than the
//! crate version.

use std::env;
use std::process::Command;

use chrono::Utc;

fn git(args: &[&str]) -> Option<String> {
    let output = Command::new("git").args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8(output.stdout).ok()?;
    Some(text.trim().to_string())
}

fn main() {
    let firmware_version = env::var("FWAGENT_FIRMWARE_VERSION")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| env::var("CARGO_PKG_VERSION").unwrap_or_default());

    // Uncommitted changes get a "-dirty" suffix so field reports are traceable
    let revision = match git(&["rev-parse", "--short", "HEAD"]) {
        Some(hash) if git(&["status", "--porcelain"]).is_some_and(|s| !s.is_empty()) => {
            format!("{hash}-dirty")
        }
        Some(hash) => hash,
        None => "unknown".to_string(),
    };

    let build_time = Utc::now().format("%Y-%m-%d %H:%M:%S UTC");

    println!("cargo:rustc-env=FIRMWARE_VERSION={firmware_version}");
    println!("cargo:rustc-env=GIT_HASH={revision}");
    println!("cargo:rustc-env=BUILD_TIME={build_time}");

    println!("cargo:rerun-if-env-changed=FWAGENT_FIRMWARE_VERSION");
    println!("cargo:rerun-if-changed=.git/HEAD");
}

//! Firmware Agent - Entry Point
//!
//! Device-resident agent that keeps an embedded node's firmware current.
//! Checks an HTTP update server for newer firmware, installs it into the
//! update slot, and stays reachable over MQTT for operator-pushed updates.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use fwagent::app::options::{slot_dir, AgentOptions};
use fwagent::app::run::{Capabilities, DeviceAgent, RunOutcome};
use fwagent::filesys::file::File;
use fwagent::firmware::device::{DeviceControl, ProcessRestart};
use fwagent::firmware::installer::FirmwareInstaller;
use fwagent::firmware::slot::FileSlot;
use fwagent::http::client::HttpClient;
use fwagent::logs::{init_logging, LogLevel, LogOptions};
use fwagent::mqtt::client::MqttClient;
use fwagent::network::link::HostNetwork;
use fwagent::storage::layout::StorageLayout;
use fwagent::storage::settings::Settings;
use fwagent::update::checker::{CheckOutcome, UpdateChecker};
use fwagent::utils::version_info;

use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> ExitCode {
    // Parse command line arguments
    let args: Vec<String> = env::args().collect();
    let mut cli_args: HashMap<String, String> = HashMap::new();

    for arg in args.iter().skip(1) {
        if let Some((key, value)) = arg.split_once('=') {
            // Handle --key=value format
            let clean_key = key.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), value.to_string());
        } else if arg.starts_with("--") {
            // Handle standalone flags like --version
            let clean_key = arg.trim_start_matches('-');
            cli_args.insert(clean_key.to_string(), "true".to_string());
        }
    }

    // Print version and exit
    let version = version_info();
    if cli_args.contains_key("version") {
        match serde_json::to_string_pretty(&version) {
            Ok(json) => println!("{json}"),
            Err(e) => eprintln!("Failed to serialize version info: {e}"),
        }
        return ExitCode::SUCCESS;
    }

    // Retrieve the settings file
    let layout = StorageLayout::default();
    let settings_file = cli_args
        .get("settings")
        .map(File::new)
        .unwrap_or_else(|| layout.settings_file());
    let settings_missing = !settings_file.exists().await;
    let mut settings = if settings_missing {
        Settings::default()
    } else {
        match settings_file.read_json::<Settings>().await {
            Ok(settings) => settings,
            Err(e) => {
                eprintln!(
                    "Unable to read settings file {:?}: {e}",
                    settings_file.path()
                );
                return ExitCode::FAILURE;
            }
        }
    };

    if let Some(level) = cli_args.get("log-level") {
        match level.parse::<LogLevel>() {
            Ok(level) => settings.log_level = level,
            Err(e) => eprintln!("Ignoring --log-level: {e}"),
        }
    }

    // Initialize logging; the guard flushes file logs on exit
    let log_options = LogOptions {
        log_level: settings.log_level.clone(),
        log_dir: settings.log_dir.clone(),
        ..Default::default()
    };
    let _log_guard = match init_logging(log_options) {
        Ok(guard) => guard,
        Err(e) => {
            println!("Failed to initialize logging: {e}");
            None
        }
    };

    info!(
        "Firmware agent {} (firmware {}, {}, built {})",
        version.version, version.firmware_version, version.git_hash, version.build_time
    );
    if settings_missing {
        warn!(
            "Settings file {:?} not found, using defaults",
            settings_file.path()
        );
    }

    let options = AgentOptions::from_settings(&settings);
    info!("Running firmware agent with options: {:?}", options);

    // Run a single update check and exit
    if cli_args.contains_key("check") {
        return match check_once(&settings, &layout, options).await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!("Update check failed: {e:#}");
                ExitCode::FAILURE
            }
        };
    }

    let caps = match build_capabilities(&settings, &layout, &options) {
        Ok(caps) => caps,
        Err(e) => {
            error!("Failed to set up the agent: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    let agent = DeviceAgent::new(options, caps);
    match agent.run(tokio::time::sleep, await_shutdown_signal()).await {
        Ok(RunOutcome::Shutdown) => ExitCode::SUCCESS,
        Ok(RunOutcome::Restarted) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Failed to run the agent: {e}");
            ExitCode::FAILURE
        }
    }
}

fn build_capabilities(
    settings: &Settings,
    layout: &StorageLayout,
    options: &AgentOptions,
) -> anyhow::Result<Capabilities> {
    let control_plane = MqttClient::new(
        options.control_plane.broker_address.clone(),
        options.control_plane.keep_alive,
    )
    .context("invalid MQTT broker settings")?;

    Ok(Capabilities {
        network: Box::new(HostNetwork::new(options.network.interface.clone())),
        control_plane: Box::new(control_plane),
        http: Arc::new(http_client(settings)?),
        slot: Box::new(file_slot(settings, layout)),
        device: Box::new(ProcessRestart::new(settings.slot.restart_command.clone())),
    })
}

fn http_client(settings: &Settings) -> anyhow::Result<HttpClient> {
    HttpClient::new(Duration::from_secs(settings.http_timeout_secs))
        .context("failed to build HTTP client")
}

fn file_slot(settings: &Settings, layout: &StorageLayout) -> FileSlot {
    let dir: PathBuf = slot_dir(settings, layout);
    FileSlot::new(dir, settings.slot.capacity_bytes)
}

/// One update check pass without the control plane
async fn check_once(
    settings: &Settings,
    layout: &StorageLayout,
    options: AgentOptions,
) -> anyhow::Result<()> {
    let checker = UpdateChecker::new(Arc::new(http_client(settings)?), options.checker);
    let mut installer =
        FirmwareInstaller::new(Box::new(file_slot(settings, layout)), options.installer);

    match checker.check_for_update(&mut installer).await? {
        CheckOutcome::UpToDate { latest } => {
            info!(
                "Running {}, server advertises {}; nothing to do",
                checker.current_version(),
                latest
            );
            Ok(())
        }
        CheckOutcome::Installed(installed) => {
            info!("Installed {} byte image, restarting...", installed.size);
            ProcessRestart::new(settings.slot.restart_command.clone())
                .restart()
                .await?;
            Ok(())
        }
    }
}

async fn await_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let (mut sigterm, mut sigint) =
            match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
                (Ok(sigterm), Ok(sigint)) => (sigterm, sigint),
                (Err(e), _) | (_, Err(e)) => {
                    warn!("Failed to install signal handlers: {e}, falling back to Ctrl+C");
                    if let Err(e) = tokio::signal::ctrl_c().await {
                        error!("Failed to listen for Ctrl+C: {e}");
                        return std::future::pending().await;
                    }
                    info!("Ctrl+C received, shutting down...");
                    return;
                }
            };

        tokio::select! {
            _ = sigterm.recv() => {
                info!("SIGTERM received, shutting down...");
            }
            _ = sigint.recv() => {
                info!("SIGINT received, shutting down...");
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {e}");
            return std::future::pending().await;
        }
        info!("Ctrl+C received, shutting down...");
    }
}

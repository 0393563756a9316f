//! Main agent run loop

use std::future::Future;
use std::pin::pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{error, info, warn};

use crate::app::options::AgentOptions;
use crate::errors::AgentError;
use crate::firmware::device::DeviceControl;
use crate::firmware::installer::{FirmwareInstaller, Installed};
use crate::firmware::slot::UpdateSlot;
use crate::http::client::HttpFetch;
use crate::identity::DeviceIdentity;
use crate::mqtt::client::ControlPlane;
use crate::mqtt::session::{Announcement, Command, ControlPlaneSession};
use crate::network::link::NetworkLink;
use crate::update::checker::{CheckOutcome, UpdateChecker};
use crate::utils::{retry, RetryPolicy};

/// External collaborators the agent drives
pub struct Capabilities {
    pub network: Box<dyn NetworkLink>,
    pub control_plane: Box<dyn ControlPlane>,
    pub http: Arc<dyn HttpFetch>,
    pub slot: Box<dyn UpdateSlot>,
    pub device: Box<dyn DeviceControl>,
}

/// How the run loop ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// A shutdown signal stopped the loop
    Shutdown,
    /// A new image was committed and the device was told to restart
    Restarted,
}

/// Update paths share one installer, so at most one install runs at a time
struct Updater {
    checker: UpdateChecker,
    installer: FirmwareInstaller,
    device: Box<dyn DeviceControl>,
}

impl Updater {
    /// Polling path. Returns `Some` when the device restarted.
    async fn check(&mut self, session: &mut ControlPlaneSession) -> Option<RunOutcome> {
        match self.checker.check_for_update(&mut self.installer).await {
            Ok(CheckOutcome::Installed(installed)) => self.restart(installed, session).await,
            Ok(CheckOutcome::UpToDate { .. }) => None,
            Err(e) => {
                error!("Update check failed: {}", e);
                None
            }
        }
    }

    /// Control-plane path: install straight from the command's reference
    async fn install_from_command(
        &mut self,
        reference: &str,
        session: &mut ControlPlaneSession,
    ) -> Option<RunOutcome> {
        warn!(
            "Installing firmware from unauthenticated control-plane command: {}",
            reference
        );
        match self
            .checker
            .install_from(reference, None, &mut self.installer)
            .await
        {
            Ok(installed) => self.restart(installed, session).await,
            Err(e) => {
                error!("Firmware update from command failed: {}", e);
                None
            }
        }
    }

    async fn restart(
        &mut self,
        installed: Installed,
        session: &mut ControlPlaneSession,
    ) -> Option<RunOutcome> {
        info!(
            "Firmware {} committed ({} bytes), restarting...",
            installed.sha256, installed.size
        );
        session.shutdown().await;

        match self.device.restart().await {
            Ok(()) => Some(RunOutcome::Restarted),
            Err(e) => {
                error!(
                    "Restart failed: {}; the new image boots on the next restart",
                    e
                );
                None
            }
        }
    }
}

enum Step {
    CheckDue,
    Polled(Result<Command, AgentError>),
}

/// Connect the session, retrying per `policy`
async fn connect_session<S, F>(
    session: &mut ControlPlaneSession,
    policy: &RetryPolicy,
    sleep_fn: &S,
) -> Result<(), AgentError>
where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    let mut attempts = 0;
    loop {
        info!("Connecting to MQTT...");
        match session.connect().await {
            Ok(()) => return Ok(()),
            Err(e) => {
                attempts += 1;
                if policy.exhausted(attempts) {
                    return Err(e);
                }
                warn!(
                    "MQTT connection failed: {}, retrying in {:?}",
                    e, policy.delay
                );
                sleep_fn(policy.delay).await;
            }
        }
    }
}

async fn wait_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Device agent: owns the options and capabilities for one device
pub struct DeviceAgent {
    options: AgentOptions,
    caps: Capabilities,
}

impl DeviceAgent {
    pub fn new(options: AgentOptions, caps: Capabilities) -> Self {
        Self { options, caps }
    }

    /// Run the device agent.
    ///
    /// Brings the network up, derives the device identity, connects the
    /// control-plane session, optionally checks for an update, then services
    /// the session until shutdown or restart. Everything runs on this one
    /// task, so a firmware install never overlaps another install or session
    /// I/O, and a shutdown signal is only observed between iterations.
    pub async fn run<S, F>(
        self,
        sleep_fn: S,
        shutdown_signal: impl Future<Output = ()>,
    ) -> Result<RunOutcome, AgentError>
    where
        S: Fn(Duration) -> F,
        F: Future<Output = ()>,
    {
        let Self { options, caps } = self;
        let mut shutdown_signal = pin!(shutdown_signal);

        info!(
            "Starting firmware agent, running version {}",
            options.checker.current_version
        );

        // Network bring-up; the identity read belongs to the same attempt
        let network = caps.network.as_ref();
        let credentials = &options.network.credentials;
        info!("Connecting to network...");
        let identity = tokio::select! {
            _ = &mut shutdown_signal => return Ok(RunOutcome::Shutdown),
            result = retry(
                &options.network.retry,
                "Network connect",
                || async move {
                    let ip = network.connect(credentials).await?;
                    let mac = network.hardware_address()?;
                    Ok::<_, AgentError>((ip, mac))
                },
                &sleep_fn,
            ) => {
                let (ip, mac) = result?;
                info!("Network up, IP address: {}", ip);
                DeviceIdentity::from_mac(mac)
            }
        };
        info!("Device identity: {}", identity);

        let mut session = ControlPlaneSession::new(
            caps.control_plane,
            &identity,
            &options.control_plane.client_id_prefix,
            Announcement {
                version: options.checker.current_version.clone(),
                environment: options.environment.clone(),
            },
        );

        let mut updater = Updater {
            checker: UpdateChecker::new(caps.http, options.checker.clone()),
            installer: FirmwareInstaller::new(caps.slot, options.installer.clone()),
            device: caps.device,
        };

        let reconnect = &options.control_plane.reconnect;
        tokio::select! {
            _ = &mut shutdown_signal => return Ok(RunOutcome::Shutdown),
            result = connect_session(&mut session, reconnect, &sleep_fn) => result?,
        }

        if options.checks_enabled() {
            if let Some(outcome) = updater.check(&mut session).await {
                return Ok(outcome);
            }
        } else {
            info!("Development mode, skipping update check");
        }

        let interval = options
            .update_check_interval
            .filter(|_| options.checks_enabled());
        let mut next_check = interval.map(|interval| Instant::now() + interval);

        loop {
            if !session.is_connected() {
                warn!("Control-plane disconnected, reconnecting...");
                tokio::select! {
                    _ = &mut shutdown_signal => break,
                    result = connect_session(&mut session, reconnect, &sleep_fn) => result?,
                }
                continue;
            }

            let step = tokio::select! {
                _ = &mut shutdown_signal => break,
                _ = wait_until(next_check) => Step::CheckDue,
                result = session.run_once() => Step::Polled(result),
            };

            match step {
                Step::CheckDue => {
                    next_check = interval.map(|interval| Instant::now() + interval);
                    if let Some(outcome) = updater.check(&mut session).await {
                        return Ok(outcome);
                    }
                }
                Step::Polled(Ok(Command::InstallFromUrl(reference))) => {
                    if let Some(outcome) = updater
                        .install_from_command(&reference, &mut session)
                        .await
                    {
                        return Ok(outcome);
                    }
                }
                Step::Polled(Ok(Command::Ignore)) => {}
                Step::Polled(Err(e)) => {
                    warn!("Control-plane session lost: {}", e);
                }
            }
        }

        info!("Shutdown signal received, shutting down...");
        session.shutdown().await;
        Ok(RunOutcome::Shutdown)
    }
}

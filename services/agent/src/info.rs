//! Device information reporter.
//!
//! Collects the agent version, OS release and the local IP address used to
//! reach the controller, and pushes them with `SetDeviceInfo` on start and
//! then periodically. A push happens only when the info changed or the
//! previous push failed.

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ControllerClient};
use crate::models::{DeviceInfo, OsRelease};
use crate::transport::{RequestContext, TransportError};

/// Default location of the OS release file.
pub const OS_RELEASE_PATH: &str = "/etc/os-release";

/// Agent version reported to the controller.
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Parse the contents of an `os-release` file.
///
/// Lines are `KEY=value`; values may be wrapped in single or double quotes.
/// Blank lines, comments and unknown keys are ignored.
pub fn parse_os_release(contents: &str) -> OsRelease {
    let mut release = OsRelease::default();

    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            continue;
        };

        let value = unquote(value.trim());
        let slot = match key.trim() {
            "PRETTY_NAME" => &mut release.pretty_name,
            "NAME" => &mut release.name,
            "VERSION_ID" => &mut release.version_id,
            "VERSION" => &mut release.version,
            "ID" => &mut release.id,
            "ID_LIKE" => &mut release.id_like,
            _ => continue,
        };
        *slot = Some(value.to_string());
    }

    release
}

fn unquote(value: &str) -> &str {
    for quote in ['"', '\''] {
        if value.len() >= 2 && value.starts_with(quote) && value.ends_with(quote) {
            return &value[1..value.len() - 1];
        }
    }
    value
}

/// Read and parse an `os-release` file. A missing or unreadable file yields
/// an empty release.
pub async fn read_os_release(path: &Path) -> OsRelease {
    match tokio::fs::read_to_string(path).await {
        Ok(contents) => parse_os_release(&contents),
        Err(e) => {
            debug!(path = ?path, error = %e, "Failed to read os-release");
            OsRelease::default()
        }
    }
}

/// Local address of the outbound route toward `controller_url`.
///
/// Connecting a UDP socket selects a route without sending any packets.
pub async fn local_ip_toward(controller_url: &str) -> Option<IpAddr> {
    let url = reqwest::Url::parse(controller_url).ok()?;
    let host = url.host_str()?.trim_start_matches('[').trim_end_matches(']');
    let port = url.port_or_known_default().unwrap_or(443);

    let resolved = tokio::net::lookup_host((host, port)).await.ok()?;
    for addr in resolved {
        let bind = if addr.is_ipv4() { "0.0.0.0:0" } else { "[::]:0" };
        let Ok(socket) = UdpSocket::bind(bind).await else {
            continue;
        };
        if socket.connect(addr).await.is_ok() {
            if let Ok(local) = socket.local_addr() {
                return Some(local.ip());
            }
        }
    }

    None
}

/// Collect the current device info, giving up when `ctx` is cancelled.
///
/// Resolving the controller host can block on DNS, so the whole collection
/// runs under `ctx`.
pub async fn collect_device_info(
    ctx: &RequestContext,
    controller_url: &str,
    os_release_path: &Path,
) -> Result<DeviceInfo, TransportError> {
    ctx.run(async {
        DeviceInfo {
            agent_version: AGENT_VERSION.to_string(),
            ip_address: local_ip_toward(controller_url)
                .await
                .map(|ip| ip.to_string()),
            os_release: read_os_release(os_release_path).await,
        }
    })
    .await
}

/// Pushes device info when it changes.
#[derive(Debug, Default)]
pub struct InfoReporter {
    last_pushed: Option<DeviceInfo>,
}

impl InfoReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Push `info` unless it equals the last successful push. Returns `true`
    /// if a push happened.
    pub async fn report(
        &mut self,
        client: &ControllerClient,
        ctx: &RequestContext,
        info: DeviceInfo,
    ) -> Result<bool, ClientError> {
        if self.last_pushed.as_ref() == Some(&info) {
            return Ok(false);
        }

        client.set_device_info(ctx, &info).await?;
        self.last_pushed = Some(info);
        Ok(true)
    }
}

/// Info reporter settings.
#[derive(Debug, Clone)]
pub struct InfoReporterConfig {
    pub interval: Duration,
    pub os_release_path: PathBuf,
}

impl Default for InfoReporterConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(60),
            os_release_path: PathBuf::from(OS_RELEASE_PATH),
        }
    }
}

/// Run the info reporter until `ctx` is cancelled.
pub async fn run_info_reporter(
    client: ControllerClient,
    ctx: RequestContext,
    config: InfoReporterConfig,
) {
    info!(
        interval_secs = config.interval.as_secs(),
        "Starting device info reporter"
    );

    let mut reporter = InfoReporter::new();
    let mut interval = tokio::time::interval(config.interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            _ = interval.tick() => {}
        }

        let info =
            match collect_device_info(&ctx, client.base_url(), &config.os_release_path).await {
                Ok(info) => info,
                Err(e) if e.is_canceled() => break,
                Err(e) => {
                    warn!(error = %e, "Failed to collect device info");
                    continue;
                }
            };
        match reporter.report(&client, &ctx, info).await {
            Ok(true) => debug!("Device info reported"),
            Ok(false) => {}
            Err(e) if e.is_canceled() => break,
            Err(e) => warn!(error = %e, "Failed to report device info"),
        }
    }

    info!("Device info reporter shutting down");
}

//! Reverse tunnel to the controller.
//!
//! The agent keeps a persistent outbound WebSocket open to the controller.
//! Over it the controller sends JSON control messages; a `conn-ready`
//! message names a path the agent dials back to, and the resulting
//! connection is handed to a [`TunnelHandler`] (an SSH shell, for example).
//!
//! The tunnel reconnects with exponential backoff and jitter, and the
//! backoff resets after every successful connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ControllerClient};
use crate::transport::{RequestContext, WebSocketConnection};

/// Controller keep-alive.
pub const KEEP_ALIVE: &str = "keep-alive";

/// Controller asks the agent to dial back.
pub const CONN_READY: &str = "conn-ready";

/// Serves a connection the controller asked the agent to open.
#[async_trait]
pub trait TunnelHandler: Send + Sync + 'static {
    /// Serve `conn` until it closes. `ctx` is cancelled on agent shutdown.
    async fn handle(&self, ctx: RequestContext, conn: WebSocketConnection);
}

/// Control message sent by the controller over the tunnel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ControlMessage {
    pub command: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conn_path: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub err: Option<String>,
}

/// What the agent does in response to a control message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TunnelAction {
    KeepAlive,
    Dial(String),
    Ignore,
}

impl ControlMessage {
    pub fn action(&self) -> TunnelAction {
        match self.command.as_str() {
            KEEP_ALIVE => TunnelAction::KeepAlive,
            CONN_READY if self.err.as_deref().is_some_and(|e| !e.is_empty()) => {
                TunnelAction::Ignore
            }
            CONN_READY => match self.conn_path.as_deref() {
                Some(path) if !path.is_empty() => TunnelAction::Dial(path.to_string()),
                _ => TunnelAction::Ignore,
            },
            _ => TunnelAction::Ignore,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub base: Duration,

    /// Maximum delay.
    pub max: Duration,

    /// Jitter factor (0.0 to 1.0).
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            max: Duration::from_secs(60),
            jitter: 0.25,
        }
    }
}

impl BackoffPolicy {
    /// Delay for the given attempt number, starting at 0.
    pub fn delay(&self, attempt: u32) -> Duration {
        let delay = self.base.as_millis() as f64 * 2.0_f64.powi(attempt.min(32) as i32);
        let delay = delay.min(self.max.as_millis() as f64);

        let jitter_range = delay * self.jitter.clamp(0.0, 1.0);
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(0.0..jitter_range)
        } else {
            0.0
        };

        Duration::from_millis((delay + jitter) as u64)
    }
}

/// Keep the reverse tunnel open until `ctx` is cancelled.
pub async fn run_tunnel(
    client: ControllerClient,
    handler: Arc<dyn TunnelHandler>,
    ctx: RequestContext,
    policy: BackoffPolicy,
) {
    info!("Starting reverse tunnel");

    let mut sessions = JoinSet::new();
    let mut attempt = 0u32;

    loop {
        match client.open_reverse_tunnel(&ctx).await {
            Ok(conn) => {
                attempt = 0;
                info!("Reverse tunnel connected");

                match serve_tunnel(&client, &handler, &ctx, conn, &mut sessions).await {
                    Ok(()) => info!("Reverse tunnel closed by controller"),
                    Err(e) if e.is_canceled() => break,
                    Err(e) => warn!(error = %e, "Reverse tunnel failed"),
                }
            }
            Err(e) if e.is_canceled() => break,
            Err(e) => warn!(error = %e, attempt, "Failed to open reverse tunnel"),
        }

        let delay = policy.delay(attempt);
        attempt = attempt.saturating_add(1);
        debug!(delay_ms = delay.as_millis() as u64, "Reconnecting reverse tunnel");
        if ctx.sleep(delay).await.is_err() {
            break;
        }
    }

    sessions.shutdown().await;
    info!("Reverse tunnel shutting down");
}

/// Read control messages until the tunnel closes.
async fn serve_tunnel(
    client: &ControllerClient,
    handler: &Arc<dyn TunnelHandler>,
    ctx: &RequestContext,
    mut conn: WebSocketConnection,
    sessions: &mut JoinSet<()>,
) -> Result<(), ClientError> {
    loop {
        while sessions.try_join_next().is_some() {}

        let Some(payload) = ctx.run(conn.recv()).await?? else {
            return Ok(());
        };

        let message: ControlMessage = match serde_json::from_slice(&payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "Ignoring malformed tunnel message");
                continue;
            }
        };

        match message.action() {
            TunnelAction::KeepAlive => debug!("Tunnel keep-alive"),
            TunnelAction::Dial(path) => {
                let client = client.clone();
                let handler = Arc::clone(handler);
                let ctx = ctx.clone();
                sessions.spawn(async move {
                    match client.reverse_dial(&ctx, &path).await {
                        Ok(conn) => {
                            debug!(conn_path = %path, "Reverse connection established");
                            handler.handle(ctx, conn).await;
                        }
                        Err(e) if e.is_canceled() => {}
                        Err(e) => warn!(conn_path = %path, error = %e, "Reverse dial failed"),
                    }
                });
            }
            TunnelAction::Ignore => {
                if let Some(err) = message.err.as_deref().filter(|e| !e.is_empty()) {
                    warn!(command = %message.command, error = %err, "Controller reported tunnel error");
                } else {
                    debug!(command = %message.command, "Ignoring tunnel message");
                }
            }
        }
    }
}

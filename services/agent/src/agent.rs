//! Agent driver.
//!
//! Owns the lifecycle of every background task:
//! 1. Load the device identity, registering the device first if needed
//! 2. Poll the controller for the desired bundle
//! 3. Run the three observation reconcile loops
//! 4. Report device info
//! 5. Keep the reverse tunnel open, when a handler is supplied
//!
//! All tasks share one shutdown signal. [`Agent::stop`] triggers it and
//! joins every task, aborting whatever is still running after the grace
//! period.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::client::ControllerClient;
use crate::config::Config;
use crate::identity::{AccessKey, Identity, IdentityError, IdentityStore};
use crate::info::{run_info_reporter, InfoReporterConfig};
use crate::reconciler::{
    spawn_collector, ApplicationStatusLoop, LoopState, ObservationStore, ServiceStateLoop,
    ServiceStatusLoop,
};
use crate::snapshot::BundleSnapshot;
use crate::supervisor::{ObservationReporter, StatusReporter, Supervisor};
use crate::transport::{RequestContext, Transport, TransportError};
use crate::tunnel::{run_tunnel, TunnelHandler};

/// Errors that stop the agent from starting.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("device is not registered and no registration token was provided")]
    MissingRegistrationToken,

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to create configuration directory {path:?}: {source}")]
    ConfDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("agent start canceled")]
    Canceled,
}

/// Shared shutdown trigger.
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    tx: Arc<watch::Sender<bool>>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx: Arc::new(tx) }
    }

    /// Signal shutdown. Idempotent.
    pub fn trigger(&self) {
        self.tx.send_replace(true);
    }

    pub fn is_triggered(&self) -> bool {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.tx.subscribe()
    }

    /// Request context cancelled by this signal.
    pub fn context(&self) -> RequestContext {
        RequestContext::new(self.subscribe())
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

/// A running agent.
pub struct Agent {
    config: Config,
    shutdown: ShutdownSignal,
    identity: Arc<Identity>,
    client: ControllerClient,
    snapshot: BundleSnapshot,
    loops: Vec<(&'static str, watch::Receiver<LoopState>)>,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Agent {
    /// Register if needed and spawn every background task.
    ///
    /// Returns [`AgentError::Canceled`] if `shutdown` fires before the
    /// device is registered.
    pub async fn start(
        config: Config,
        supervisor: Arc<dyn Supervisor>,
        tunnel_handler: Option<Arc<dyn TunnelHandler>>,
        shutdown: ShutdownSignal,
    ) -> Result<Self, AgentError> {
        let ctx = shutdown.context();

        tokio::fs::create_dir_all(&config.conf_dir)
            .await
            .map_err(|source| AgentError::ConfDir {
                path: config.conf_dir.clone(),
                source,
            })?;

        info!(
            controller = %config.controller_url,
            project = %config.project,
            state_dir = ?config.state_dir,
            conf_dir = ?config.conf_dir,
            server_port = config.server_port,
            "Starting deviceplane agent"
        );

        let transport = Transport::new()?;
        let unauthenticated =
            ControllerClient::new(transport, &config.controller_url, config.project.clone());

        let identity = Arc::new(ensure_identity(&config, &unauthenticated, &ctx).await?);
        let client = unauthenticated.with_identity(Arc::clone(&identity));

        let snapshot = BundleSnapshot::new();
        let reporter = Arc::new(ObservationReporter::new(
            Arc::new(client.clone()) as Arc<dyn StatusReporter>
        ));

        let mut tasks = Vec::new();
        let mut loops = Vec::new();

        tasks.push((
            "bundle_poller",
            tokio::spawn(run_bundle_poller(
                client.clone(),
                snapshot.clone(),
                supervisor,
                reporter,
                ctx.clone(),
                config.bundle_poll_interval,
            )),
        ));

        let store: Arc<dyn ObservationStore> = Arc::new(client.clone());
        let handles = [
            spawn_collector(
                ApplicationStatusLoop::new(Arc::clone(&store)),
                snapshot.clone(),
                ctx.clone(),
                config.reconciler,
            ),
            spawn_collector(
                ServiceStatusLoop::new(Arc::clone(&store)),
                snapshot.clone(),
                ctx.clone(),
                config.reconciler,
            ),
            spawn_collector(
                ServiceStateLoop::new(store),
                snapshot.clone(),
                ctx.clone(),
                config.reconciler,
            ),
        ];
        for handle in handles {
            loops.push((handle.name, handle.state));
            tasks.push((handle.name, handle.handle));
        }

        tasks.push((
            "info_reporter",
            tokio::spawn(run_info_reporter(
                client.clone(),
                ctx.clone(),
                InfoReporterConfig {
                    interval: config.info_interval,
                    os_release_path: config.os_release_path.clone(),
                },
            )),
        ));

        if let Some(handler) = tunnel_handler {
            tasks.push((
                "tunnel",
                tokio::spawn(run_tunnel(
                    client.clone(),
                    handler,
                    ctx.clone(),
                    config.tunnel_backoff,
                )),
            ));
        }

        info!(
            device_id = %identity.device_id,
            task_count = tasks.len(),
            "Agent started"
        );

        Ok(Self {
            config,
            shutdown,
            identity,
            client,
            snapshot,
            loops,
            tasks,
        })
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn client(&self) -> &ControllerClient {
        &self.client
    }

    pub fn snapshot(&self) -> &BundleSnapshot {
        &self.snapshot
    }

    pub fn shutdown_signal(&self) -> &ShutdownSignal {
        &self.shutdown
    }

    /// Current state of each reconcile loop.
    pub fn loop_states(&self) -> Vec<(&'static str, LoopState)> {
        self.loops
            .iter()
            .map(|(name, rx)| (*name, *rx.borrow()))
            .collect()
    }

    /// Signal shutdown and join every task.
    ///
    /// Tasks still running after the grace period are aborted. Returns the
    /// names of aborted tasks.
    pub async fn stop(self) -> Vec<&'static str> {
        info!("Stopping agent");
        self.shutdown.trigger();

        let deadline = Instant::now() + self.config.stop_grace;
        let mut aborted = Vec::new();

        for (name, mut handle) in self.tasks {
            match tokio::time::timeout_at(deadline, &mut handle).await {
                Ok(Ok(())) => debug!(task = name, "Task stopped"),
                Ok(Err(e)) => error!(task = name, error = %e, "Task panicked"),
                Err(_) => {
                    warn!(task = name, "Task did not stop within grace period, aborting");
                    handle.abort();
                    let _ = handle.await;
                    aborted.push(name);
                }
            }
        }

        info!("Agent shutdown complete");
        aborted
    }
}

/// Load the stored identity or register the device.
async fn ensure_identity(
    config: &Config,
    client: &ControllerClient,
    ctx: &RequestContext,
) -> Result<Identity, AgentError> {
    let store = IdentityStore::new(&config.state_dir);
    if let Some(identity) = store.load().await? {
        info!(device_id = %identity.device_id, "Loaded device identity");
        return Ok(identity);
    }

    let token = config
        .registration_token
        .as_ref()
        .ok_or(AgentError::MissingRegistrationToken)?;

    info!(project = %config.project, "Device not registered, registering");

    let mut attempt = 0u32;
    let response = loop {
        attempt += 1;
        match client.register_device(ctx, token.expose()).await {
            Ok(response) => break response,
            Err(e) if e.is_canceled() => return Err(AgentError::Canceled),
            Err(e) => warn!(error = %e, attempt, "Registration failed, will retry"),
        }

        if ctx.sleep(config.registration_retry_interval).await.is_err() {
            return Err(AgentError::Canceled);
        }
    };

    let identity = Identity {
        device_id: response.device_id,
        access_key: AccessKey::new(response.access_key),
    };
    store.save(&identity).await?;

    info!(device_id = %identity.device_id, attempt, "Device registered");
    Ok(identity)
}

/// Fetch the bundle periodically, publish it and hand it to the supervisor.
async fn run_bundle_poller(
    client: ControllerClient,
    snapshot: BundleSnapshot,
    supervisor: Arc<dyn Supervisor>,
    reporter: Arc<ObservationReporter>,
    ctx: RequestContext,
    poll_interval: Duration,
) {
    info!(
        interval_secs = poll_interval.as_secs(),
        "Starting bundle poller"
    );

    let mut consecutive_failures = 0u32;
    let mut interval = tokio::time::interval(poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            _ = interval.tick() => {}
        }

        match client.get_bundle(&ctx).await {
            Ok(bundle) => {
                consecutive_failures = 0;
                let bundle = snapshot.store(bundle);
                reporter.retain_desired(&bundle.desired_services());

                if let Err(e) = supervisor.apply(&ctx, &bundle, &reporter).await {
                    warn!(error = %e, "Supervisor failed to apply bundle");
                }
            }
            Err(e) if e.is_canceled() => break,
            Err(e) => {
                consecutive_failures += 1;
                if consecutive_failures <= 3 {
                    warn!(error = %e, consecutive_failures, "Bundle fetch failed");
                } else {
                    error!(error = %e, consecutive_failures, "Bundle fetch failed repeatedly");
                }
            }
        }
    }

    info!("Bundle poller shutting down");
}

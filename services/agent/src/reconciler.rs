//! Observation garbage collection.
//!
//! Three loops keep the controller's stored observations consistent with the
//! desired bundle:
//! - [`ApplicationStatusLoop`] deletes statuses of removed applications
//! - [`ServiceStatusLoop`] deletes statuses of removed services
//! - [`ServiceStateLoop`] deletes states of removed services
//!
//! Each loop implements [`Collector`] and is driven by [`run_collector`].
//! Every tick works from one snapshot of the bundle: the desired set and the
//! orphan set are both derived from that snapshot, and each orphan gets its
//! own delete with a bounded deadline.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use deviceplane_id::ApplicationId;
use deviceplane_reconcile::{application_orphans, service_orphans, Orphan, ServiceKey};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::client::{ClientError, ControllerClient};
use crate::models::Bundle;
use crate::snapshot::BundleSnapshot;
use crate::transport::RequestContext;

/// Reconciliation loop configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconcilerConfig {
    /// Interval between reconciliation passes.
    pub tick_interval: Duration,

    /// Deadline for each individual delete.
    pub delete_timeout: Duration,
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            delete_timeout: Duration::from_secs(60),
        }
    }
}

/// Lifecycle of a reconciliation loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// No bundle has been stored yet.
    WaitingForBundle,
    /// Ticking.
    Reconciling,
    /// Shutdown observed, finishing up.
    Stopping,
    /// Terminal.
    Done,
}

impl LoopState {
    pub fn as_str(&self) -> &'static str {
        match self {
            LoopState::WaitingForBundle => "waiting_for_bundle",
            LoopState::Reconciling => "reconciling",
            LoopState::Stopping => "stopping",
            LoopState::Done => "done",
        }
    }
}

impl fmt::Display for LoopState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub orphans: usize,
    pub deleted: usize,
    pub failed: usize,
}

// =============================================================================
// Traits
// =============================================================================

/// Delete side of the controller's observation API.
#[async_trait]
pub trait ObservationStore: Send + Sync {
    async fn delete_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
    ) -> Result<(), ClientError>;

    async fn delete_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError>;

    async fn delete_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError>;
}

#[async_trait]
impl ObservationStore for ControllerClient {
    async fn delete_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
    ) -> Result<(), ClientError> {
        ControllerClient::delete_application_status(self, ctx, application_id).await
    }

    async fn delete_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError> {
        ControllerClient::delete_service_status(self, ctx, key).await
    }

    async fn delete_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError> {
        ControllerClient::delete_service_state(self, ctx, key).await
    }
}

/// One kind of observation garbage collection.
#[async_trait]
pub trait Collector: Send + Sync + 'static {
    type Key: fmt::Display + Send + Sync + 'static;

    /// Loop name used in logs.
    fn name(&self) -> &'static str;

    /// Observations in `bundle` that are not backed by its desired state.
    fn orphans(&self, bundle: &Bundle) -> Vec<Orphan<Self::Key>>;

    async fn delete(&self, ctx: &RequestContext, key: &Self::Key) -> Result<(), ClientError>;
}

// =============================================================================
// Collectors
// =============================================================================

/// Deletes application statuses whose application left the bundle.
#[derive(Clone)]
pub struct ApplicationStatusLoop {
    store: Arc<dyn ObservationStore>,
}

impl ApplicationStatusLoop {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Collector for ApplicationStatusLoop {
    type Key = ApplicationId;

    fn name(&self) -> &'static str {
        "application_status"
    }

    fn orphans(&self, bundle: &Bundle) -> Vec<Orphan<ApplicationId>> {
        let desired = bundle.desired_applications();
        application_orphans(
            &desired,
            bundle.application_statuses.iter().map(|s| &s.application_id),
        )
    }

    async fn delete(&self, ctx: &RequestContext, key: &ApplicationId) -> Result<(), ClientError> {
        self.store.delete_application_status(ctx, key).await
    }
}

/// Deletes service statuses whose service left the bundle.
#[derive(Clone)]
pub struct ServiceStatusLoop {
    store: Arc<dyn ObservationStore>,
}

impl ServiceStatusLoop {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Collector for ServiceStatusLoop {
    type Key = ServiceKey;

    fn name(&self) -> &'static str {
        "service_status"
    }

    fn orphans(&self, bundle: &Bundle) -> Vec<Orphan<ServiceKey>> {
        let desired = bundle.desired_services();
        service_orphans(&desired, bundle.service_statuses.iter().map(|s| s.key()))
    }

    async fn delete(&self, ctx: &RequestContext, key: &ServiceKey) -> Result<(), ClientError> {
        self.store.delete_service_status(ctx, key).await
    }
}

/// Deletes service states whose service left the bundle.
#[derive(Clone)]
pub struct ServiceStateLoop {
    store: Arc<dyn ObservationStore>,
}

impl ServiceStateLoop {
    pub fn new(store: Arc<dyn ObservationStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Collector for ServiceStateLoop {
    type Key = ServiceKey;

    fn name(&self) -> &'static str {
        "service_state"
    }

    fn orphans(&self, bundle: &Bundle) -> Vec<Orphan<ServiceKey>> {
        let desired = bundle.desired_services();
        service_orphans(&desired, bundle.service_states.iter().map(|s| s.key()))
    }

    async fn delete(&self, ctx: &RequestContext, key: &ServiceKey) -> Result<(), ClientError> {
        self.store.delete_service_state(ctx, key).await
    }
}

// =============================================================================
// Loop skeleton
// =============================================================================

/// Run one reconciliation pass against `bundle`.
///
/// Deletes are independent: a failure is logged and the pass continues. No
/// new delete starts once `ctx` is cancelled.
pub async fn reconcile_once<C: Collector>(
    collector: &C,
    bundle: &Bundle,
    ctx: &RequestContext,
    config: &ReconcilerConfig,
) -> TickReport {
    let orphans = collector.orphans(bundle);
    let mut report = TickReport {
        orphans: orphans.len(),
        ..TickReport::default()
    };

    for orphan in orphans {
        if ctx.is_cancelled() {
            break;
        }

        let delete_ctx = ctx.with_timeout(config.delete_timeout);
        match collector.delete(&delete_ctx, &orphan.key).await {
            Ok(()) => {
                report.deleted += 1;
                info!(
                    loop_name = collector.name(),
                    key = %orphan.key,
                    reason = %orphan.reason,
                    "Deleted orphaned observation"
                );
            }
            Err(e) if e.is_canceled() => break,
            Err(e) => {
                report.failed += 1;
                warn!(
                    loop_name = collector.name(),
                    key = %orphan.key,
                    reason = %orphan.reason,
                    error = %e,
                    "Failed to delete orphaned observation, will retry"
                );
            }
        }
    }

    report
}

/// Publishes [`LoopState::Done`] when the loop future finishes or is dropped.
struct DoneGuard<'a>(&'a watch::Sender<LoopState>);

impl Drop for DoneGuard<'_> {
    fn drop(&mut self) {
        self.0.send_replace(LoopState::Done);
    }
}

/// Drive `collector` until `ctx` is cancelled.
///
/// Waits for the first bundle, then reconciles every `tick_interval`. A tick
/// that overruns delays the next one instead of bursting.
pub async fn run_collector<C: Collector>(
    collector: C,
    snapshot: BundleSnapshot,
    ctx: RequestContext,
    config: ReconcilerConfig,
    state: watch::Sender<LoopState>,
) {
    let _done = DoneGuard(&state);
    let name = collector.name();

    state.send_replace(LoopState::WaitingForBundle);
    debug!(loop_name = name, "Waiting for first bundle");

    tokio::select! {
        biased;
        _ = ctx.cancelled() => {
            state.send_replace(LoopState::Stopping);
            info!(loop_name = name, "Reconcile loop stopped before first bundle");
            return;
        }
        _ = snapshot.when_first_stored() => {}
    }

    state.send_replace(LoopState::Reconciling);
    info!(
        loop_name = name,
        tick_interval_ms = config.tick_interval.as_millis() as u64,
        "Starting reconcile loop"
    );

    let mut interval = tokio::time::interval(config.tick_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            _ = ctx.cancelled() => break,
            _ = interval.tick() => {}
        }

        let Some(bundle) = snapshot.load() else {
            continue;
        };

        let report = reconcile_once(&collector, &bundle, &ctx, &config).await;
        if report.orphans > 0 {
            debug!(
                loop_name = name,
                orphans = report.orphans,
                deleted = report.deleted,
                failed = report.failed,
                "Reconcile tick complete"
            );
        }
    }

    state.send_replace(LoopState::Stopping);
    info!(loop_name = name, "Reconcile loop shutting down");
}

/// A spawned reconciliation loop.
#[derive(Debug)]
pub struct LoopHandle {
    pub name: &'static str,
    pub state: watch::Receiver<LoopState>,
    pub handle: JoinHandle<()>,
}

/// Spawn [`run_collector`] on the current runtime.
pub fn spawn_collector<C: Collector>(
    collector: C,
    snapshot: BundleSnapshot,
    ctx: RequestContext,
    config: ReconcilerConfig,
) -> LoopHandle {
    let name = collector.name();
    let (state_tx, state_rx) = watch::channel(LoopState::WaitingForBundle);
    let handle = tokio::spawn(run_collector(collector, snapshot, ctx, config, state_tx));

    LoopHandle {
        name,
        state: state_rx,
        handle,
    }
}

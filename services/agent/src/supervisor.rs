//! Interface to the service supervisor.
//!
//! The supervisor realizes the bundle on the device (pulling images,
//! starting containers) and reports what it observes through an
//! [`ObservationReporter`]. The agent ships [`LoggingSupervisor`], which
//! only logs the desired state.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use deviceplane_id::ApplicationId;
use deviceplane_reconcile::{DesiredServices, ServiceKey};
use tracing::{debug, info};

use crate::client::{ClientError, ControllerClient};
use crate::models::{ApplicationStatusReport, Bundle, ServiceStateReport, ServiceStatusReport};
use crate::transport::RequestContext;

/// Realizes a bundle on the device.
#[async_trait]
pub trait Supervisor: Send + Sync {
    /// Apply the latest desired bundle. Called after every successful fetch.
    async fn apply(
        &self,
        ctx: &RequestContext,
        bundle: &Bundle,
        reporter: &ObservationReporter,
    ) -> Result<()>;
}

/// Push side of the controller's observation API.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    async fn set_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
        status: &ApplicationStatusReport,
    ) -> Result<(), ClientError>;

    async fn set_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        status: &ServiceStatusReport,
    ) -> Result<(), ClientError>;

    async fn set_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        state: &ServiceStateReport,
    ) -> Result<(), ClientError>;
}

#[async_trait]
impl StatusReporter for ControllerClient {
    async fn set_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
        status: &ApplicationStatusReport,
    ) -> Result<(), ClientError> {
        ControllerClient::set_application_status(self, ctx, application_id, status).await
    }

    async fn set_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        status: &ServiceStatusReport,
    ) -> Result<(), ClientError> {
        ControllerClient::set_service_status(self, ctx, key, status).await
    }

    async fn set_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        state: &ServiceStateReport,
    ) -> Result<(), ClientError> {
        ControllerClient::set_service_state(self, ctx, key, state).await
    }
}

#[derive(Debug, Default)]
struct Pushed {
    application_statuses: HashMap<ApplicationId, ApplicationStatusReport>,
    service_statuses: HashMap<ServiceKey, ServiceStatusReport>,
    service_states: HashMap<ServiceKey, ServiceStateReport>,
}

/// Pushes observations only when they change.
///
/// The last successfully pushed value is remembered per key. Failed pushes
/// are not remembered, so reporting the same value again retries them.
pub struct ObservationReporter<R: ?Sized = dyn StatusReporter> {
    reporter: Arc<R>,
    pushed: Mutex<Pushed>,
}

impl<R: StatusReporter + ?Sized> ObservationReporter<R> {
    pub fn new(reporter: Arc<R>) -> Self {
        Self {
            reporter,
            pushed: Mutex::new(Pushed::default()),
        }
    }

    /// Report an application status. Returns `true` if it was pushed.
    pub async fn report_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
        status: ApplicationStatusReport,
    ) -> Result<bool, ClientError> {
        if self.lock().application_statuses.get(application_id) == Some(&status) {
            return Ok(false);
        }

        self.reporter
            .set_application_status(ctx, application_id, &status)
            .await?;

        debug!(
            application_id = %application_id,
            current_release_id = %status.current_release_id,
            "Application status reported"
        );
        self.lock()
            .application_statuses
            .insert(application_id.clone(), status);
        Ok(true)
    }

    /// Report a service status. Returns `true` if it was pushed.
    pub async fn report_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        status: ServiceStatusReport,
    ) -> Result<bool, ClientError> {
        if self.lock().service_statuses.get(key) == Some(&status) {
            return Ok(false);
        }

        self.reporter.set_service_status(ctx, key, &status).await?;

        debug!(
            application_id = %key.application_id,
            service = %key.service,
            current_release_id = %status.current_release_id,
            "Service status reported"
        );
        self.lock().service_statuses.insert(key.clone(), status);
        Ok(true)
    }

    /// Report a service state. Returns `true` if it was pushed.
    pub async fn report_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        state: ServiceStateReport,
    ) -> Result<bool, ClientError> {
        if self.lock().service_states.get(key) == Some(&state) {
            return Ok(false);
        }

        self.reporter.set_service_state(ctx, key, &state).await?;

        debug!(
            application_id = %key.application_id,
            service = %key.service,
            state = %state.state,
            "Service state reported"
        );
        self.lock().service_states.insert(key.clone(), state);
        Ok(true)
    }

    /// Drop everything remembered for `application_id`, so a re-created
    /// application reports again.
    pub fn forget_application(&self, application_id: &ApplicationId) {
        let mut pushed = self.lock();
        pushed.application_statuses.remove(application_id);
        pushed
            .service_statuses
            .retain(|key, _| &key.application_id != application_id);
        pushed
            .service_states
            .retain(|key, _| &key.application_id != application_id);
    }

    /// Forget every application and service not in `desired`.
    ///
    /// The reconcile loops delete those observations on the controller, so a
    /// service that comes back must report again even if its value is
    /// unchanged.
    pub fn retain_desired(&self, desired: &DesiredServices) {
        let mut pushed = self.lock();
        pushed
            .application_statuses
            .retain(|application_id, _| desired.contains_application(application_id));
        pushed.service_statuses.retain(|key, _| desired.contains(key));
        pushed.service_states.retain(|key, _| desired.contains(key));
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pushed> {
        // The map holds plain data, so a poisoned lock is still consistent.
        self.pushed.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Supervisor that logs the desired state and realizes nothing.
#[derive(Debug, Default)]
pub struct LoggingSupervisor {
    last: Mutex<Option<DesiredServices>>,
}

impl LoggingSupervisor {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Supervisor for LoggingSupervisor {
    async fn apply(
        &self,
        _ctx: &RequestContext,
        bundle: &Bundle,
        _reporter: &ObservationReporter,
    ) -> Result<()> {
        let desired = bundle.desired_services();

        let mut last = self.last.lock().unwrap_or_else(|e| e.into_inner());
        if last.as_ref() == Some(&desired) {
            return Ok(());
        }

        info!(
            application_count = desired.application_count(),
            "Desired state changed"
        );
        for entry in &bundle.applications {
            let services: Vec<String> = entry.service_names().map(|s| s.to_string()).collect();
            debug!(
                application_id = %entry.application.id,
                release_id = entry.latest_release.as_ref().and_then(|r| r.id.as_deref()).unwrap_or(""),
                services = ?services,
                "Desired application"
            );
        }

        *last = Some(desired);
        Ok(())
    }
}

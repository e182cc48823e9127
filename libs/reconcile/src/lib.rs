//! Observation reconciliation primitives.
//!
//! The controller stores observations (application statuses, service
//! statuses, service states) on behalf of each device. This library decides
//! which of those observations are orphans, given the device's desired
//! bundle. Key concepts:
//!
//! - **Desired set**: identifiers derived from the bundle's applications and
//!   the service keys of each application's latest release.
//! - **Observed set**: identifiers that appear in the bundle's observation
//!   lists.
//! - **Orphan**: observed but not desired. Orphans are deleted by the agent.
//!
//! # Invariants
//!
//! - Only observed identifiers are ever reported as orphans
//! - Desired identifiers are never reported as orphans
//! - Each orphan is reported once per diff, in first-appearance order
//! - Decisions are deterministic given the same inputs

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use deviceplane_id::{ApplicationId, ServiceName};

/// Why an observation is considered an orphan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OrphanReason {
    /// The observation's application is no longer in the bundle.
    ApplicationGone,

    /// The application exists but its latest release has no such service.
    ServiceGone,
}

impl OrphanReason {
    /// Short label for structured logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ApplicationGone => "application_gone",
            Self::ServiceGone => "service_gone",
        }
    }
}

impl fmt::Display for OrphanReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An observation that should be deleted, with the reason it is orphaned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Orphan<K> {
    pub key: K,
    pub reason: OrphanReason,
}

/// Identifies a per-service observation.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ServiceKey {
    pub application_id: ApplicationId,
    pub service: ServiceName,
}

impl ServiceKey {
    pub fn new(application_id: ApplicationId, service: ServiceName) -> Self {
        Self {
            application_id,
            service,
        }
    }
}

impl fmt::Display for ServiceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.application_id, self.service)
    }
}

/// Set of applications that legitimately exist for a device.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredApplications(BTreeSet<ApplicationId>);

impl DesiredApplications {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, application_id: ApplicationId) {
        self.0.insert(application_id);
    }

    pub fn contains(&self, application_id: &ApplicationId) -> bool {
        self.0.contains(application_id)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl FromIterator<ApplicationId> for DesiredApplications {
    fn from_iter<I: IntoIterator<Item = ApplicationId>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Services that legitimately exist, per application.
///
/// An application present with an empty service set is different from an
/// absent application: its service observations are orphaned with
/// [`OrphanReason::ServiceGone`] rather than [`OrphanReason::ApplicationGone`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredServices(BTreeMap<ApplicationId, BTreeSet<ServiceName>>);

impl DesiredServices {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record an application and the services of its latest release.
    ///
    /// Repeated entries for the same application are merged.
    pub fn insert_application<I>(&mut self, application_id: ApplicationId, services: I)
    where
        I: IntoIterator<Item = ServiceName>,
    {
        self.0.entry(application_id).or_default().extend(services);
    }

    /// Classify an observed `(application, service)` pair.
    ///
    /// Returns `None` when the pair is desired.
    pub fn classify(&self, key: &ServiceKey) -> Option<OrphanReason> {
        match self.0.get(&key.application_id) {
            None => Some(OrphanReason::ApplicationGone),
            Some(services) if !services.contains(&key.service) => Some(OrphanReason::ServiceGone),
            Some(_) => None,
        }
    }

    pub fn contains(&self, key: &ServiceKey) -> bool {
        self.classify(key).is_none()
    }

    pub fn contains_application(&self, application_id: &ApplicationId) -> bool {
        self.0.contains_key(application_id)
    }

    pub fn application_count(&self) -> usize {
        self.0.len()
    }
}

/// Compute orphaned application statuses.
///
/// `observed` yields the application id of every stored status, duplicates
/// allowed.
pub fn application_orphans<'a, I>(
    desired: &DesiredApplications,
    observed: I,
) -> Vec<Orphan<ApplicationId>>
where
    I: IntoIterator<Item = &'a ApplicationId>,
{
    let mut seen = BTreeSet::new();
    let mut orphans = Vec::new();

    for application_id in observed {
        if desired.contains(application_id) || !seen.insert(application_id) {
            continue;
        }
        orphans.push(Orphan {
            key: application_id.clone(),
            reason: OrphanReason::ApplicationGone,
        });
    }

    orphans
}

/// Compute orphaned per-service observations (statuses or states).
///
/// `observed` yields every stored `(application, service)` pair, duplicates
/// allowed.
pub fn service_orphans<I>(desired: &DesiredServices, observed: I) -> Vec<Orphan<ServiceKey>>
where
    I: IntoIterator<Item = ServiceKey>,
{
    let mut seen = BTreeSet::new();
    let mut orphans = Vec::new();

    for key in observed {
        let Some(reason) = desired.classify(&key) else {
            continue;
        };
        if seen.contains(&key) {
            continue;
        }
        seen.insert(key.clone());
        orphans.push(Orphan { key, reason });
    }

    orphans
}

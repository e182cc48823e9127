//! Wire types exchanged with the controller.
//!
//! The controller speaks camelCase JSON and emits `null` for empty lists, so
//! every list field tolerates both a missing key and an explicit `null`.
//! Fields the agent does not interpret are kept in flattened maps so that
//! values round-trip unchanged.
//!
//! Bundle entries whose identifiers fail validation are skipped with a
//! warning instead of failing the whole bundle. Observations and service
//! keys that cannot be addressed by URL path are never desired and never
//! deleted.

use std::collections::BTreeMap;
use std::fmt;

use deviceplane_id::{ApplicationId, DeviceId, ServiceName};
use deviceplane_reconcile::{DesiredApplications, DesiredServices, ServiceKey};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use tracing::warn;

/// Observation list element, named in skip warnings.
trait BundleEntry: for<'de> Deserialize<'de> {
    const KIND: &'static str;
}

/// Decode a list, dropping elements that fail to decode.
fn skip_invalid<'de, D, T>(deserializer: D) -> Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: BundleEntry,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut entries = Vec::with_capacity(raw.len());
    for value in raw {
        match T::deserialize(&value) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(kind = T::KIND, error = %e, entry = %value, "Skipping invalid bundle entry"),
        }
    }
    Ok(entries)
}

/// Decode the application list, dropping entries with an invalid id.
///
/// Any other decode failure still fails the bundle: skipping a well-named
/// application would orphan its observations.
fn skip_invalid_applications<'de, D>(deserializer: D) -> Result<Vec<ApplicationEntry>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Vec<Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut entries = Vec::with_capacity(raw.len());
    for value in raw {
        match ApplicationEntry::deserialize(&value) {
            Ok(entry) => entries.push(entry),
            Err(e) => {
                let invalid_id = value
                    .pointer("/application/id")
                    .and_then(Value::as_str)
                    .is_some_and(|id| ApplicationId::parse(id).is_err());
                if !invalid_id {
                    return Err(serde::de::Error::custom(e));
                }
                warn!(kind = "application", error = %e, entry = %value, "Skipping invalid bundle entry");
            }
        }
    }
    Ok(entries)
}

/// Decode a release config, dropping services with an invalid name.
fn skip_invalid_services<'de, D>(deserializer: D) -> Result<BTreeMap<ServiceName, Value>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = Option::<Map<String, Value>>::deserialize(deserializer)?.unwrap_or_default();
    let mut config = BTreeMap::new();
    for (name, value) in raw {
        match ServiceName::parse(&name) {
            Ok(service) => {
                config.insert(service, value);
            }
            Err(e) => warn!(kind = "service", service = %name, error = %e, "Skipping invalid bundle entry"),
        }
    }
    Ok(config)
}

// =============================================================================
// Bundle
// =============================================================================

/// Desired state of the device plus the observations the controller holds
/// for it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Bundle {
    #[serde(default, deserialize_with = "skip_invalid_applications")]
    pub applications: Vec<ApplicationEntry>,

    #[serde(default, deserialize_with = "skip_invalid")]
    pub application_statuses: Vec<ApplicationStatus>,

    #[serde(default, deserialize_with = "skip_invalid")]
    pub service_statuses: Vec<ServiceStatus>,

    #[serde(default, deserialize_with = "skip_invalid")]
    pub service_states: Vec<ServiceState>,
}

impl Bundle {
    /// Applications that legitimately exist on the device.
    pub fn desired_applications(&self) -> DesiredApplications {
        self.applications
            .iter()
            .map(|entry| entry.application.id.clone())
            .collect()
    }

    /// Services that legitimately exist, keyed by application.
    pub fn desired_services(&self) -> DesiredServices {
        let mut desired = DesiredServices::new();
        for entry in &self.applications {
            desired.insert_application(entry.application.id.clone(), entry.service_names());
        }
        desired
    }
}

/// One application and its latest release.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationEntry {
    pub application: Application,

    /// Absent until the application has its first release.
    #[serde(default)]
    pub latest_release: Option<Release>,
}

impl ApplicationEntry {
    /// Service names declared by the latest release.
    pub fn service_names(&self) -> impl Iterator<Item = ServiceName> + '_ {
        self.latest_release
            .iter()
            .flat_map(|release| release.config.keys().cloned())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Application {
    pub id: ApplicationId,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Release {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Service name to service config. The config body is opaque to the agent.
    #[serde(default, deserialize_with = "skip_invalid_services")]
    pub config: BTreeMap<ServiceName, Value>,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

// =============================================================================
// Observations
// =============================================================================

/// Application status stored by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatus {
    pub application_id: ApplicationId,

    #[serde(default)]
    pub current_release_id: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Service status stored by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub application_id: ApplicationId,
    pub service: ServiceName,

    #[serde(default)]
    pub current_release_id: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BundleEntry for ApplicationStatus {
    const KIND: &'static str = "application_status";
}

impl ServiceStatus {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.application_id.clone(), self.service.clone())
    }
}

/// Service state stored by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceState {
    pub application_id: ApplicationId,
    pub service: ServiceName,

    #[serde(default)]
    pub state: ServiceStateKind,

    #[serde(default)]
    pub error_message: String,

    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl BundleEntry for ServiceStatus {
    const KIND: &'static str = "service_status";
}

impl BundleEntry for ServiceState {
    const KIND: &'static str = "service_state";
}

impl ServiceState {
    pub fn key(&self) -> ServiceKey {
        ServiceKey::new(self.application_id.clone(), self.service.clone())
    }
}

/// Lifecycle state of a service container.
///
/// Unrecognised values are kept verbatim in [`ServiceStateKind::Other`] so
/// they serialize back unchanged. A missing or `null` state is
/// [`ServiceStateKind::Unknown`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub enum ServiceStateKind {
    #[default]
    Unknown,
    PullingImage,
    CreatingContainer,
    StoppingPreviousContainer,
    Running,
    Exited,
    Other(String),
}

impl ServiceStateKind {
    pub fn as_str(&self) -> &str {
        match self {
            ServiceStateKind::Unknown => "service state unknown",
            ServiceStateKind::PullingImage => "pulling image",
            ServiceStateKind::CreatingContainer => "creating container",
            ServiceStateKind::StoppingPreviousContainer => "stopping previous container",
            ServiceStateKind::Running => "running",
            ServiceStateKind::Exited => "exited",
            ServiceStateKind::Other(s) => s,
        }
    }

    fn from_wire(s: String) -> Self {
        match s.as_str() {
            "service state unknown" => ServiceStateKind::Unknown,
            "pulling image" => ServiceStateKind::PullingImage,
            "creating container" => ServiceStateKind::CreatingContainer,
            "stopping previous container" => ServiceStateKind::StoppingPreviousContainer,
            "running" => ServiceStateKind::Running,
            "exited" => ServiceStateKind::Exited,
            _ => ServiceStateKind::Other(s),
        }
    }
}

impl Serialize for ServiceStateKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ServiceStateKind {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = Option::<String>::deserialize(deserializer)?;
        Ok(s.map(Self::from_wire).unwrap_or_default())
    }
}

impl fmt::Display for ServiceStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Push requests
// =============================================================================

/// Body of `SetApplicationStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplicationStatusReport {
    pub current_release_id: String,
}

/// Body of `SetServiceStatus`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatusReport {
    pub current_release_id: String,
}

/// Body of `SetServiceState`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStateReport {
    pub state: ServiceStateKind,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error_message: String,
}

// =============================================================================
// Registration and device info
// =============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceRequest<'a> {
    pub device_registration_token_id: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterDeviceResponse {
    pub device_id: DeviceId,
    pub access_key: String,
}

impl fmt::Debug for RegisterDeviceResponse {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisterDeviceResponse")
            .field("device_id", &self.device_id)
            .field("access_key", &"<redacted>")
            .finish()
    }
}

/// Device information pushed via `SetDeviceInfo`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub agent_version: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip_address: Option<String>,

    #[serde(default)]
    pub os_release: OsRelease,
}

/// Subset of `/etc/os-release`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsRelease {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pretty_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id_like: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bundle_deserialization() {
        let json = r#"{
            "applications": [
                {
                    "application": {"id": "app1", "name": "web", "projectId": "prj_1"},
                    "latestRelease": {
                        "id": "rel_1",
                        "config": {"svcA": {"image": "nginx"}, "svcB": {}}
                    }
                },
                {"application": {"id": "app2"}, "latestRelease": null}
            ],
            "applicationStatuses": [{"applicationId": "app1", "currentReleaseId": "rel_1"}],
            "serviceStatuses": null,
            "serviceStates": [
                {"applicationId": "app1", "service": "svcA", "state": "running", "errorMessage": ""}
            ]
        }"#;

        let bundle: Bundle = serde_json::from_str(json).unwrap();
        assert_eq!(bundle.applications.len(), 2);
        assert_eq!(
            bundle.applications[0].application.extra.get("projectId"),
            Some(&Value::from("prj_1"))
        );
        assert!(bundle.applications[1].latest_release.is_none());
        assert_eq!(bundle.application_statuses[0].current_release_id, "rel_1");
        assert!(bundle.service_statuses.is_empty());
        assert_eq!(bundle.service_states[0].state, ServiceStateKind::Running);
    }

    #[test]
    fn test_empty_object_is_empty_bundle() {
        let bundle: Bundle = serde_json::from_str("{}").unwrap();
        assert_eq!(bundle, Bundle::default());
    }

    #[test]
    fn test_desired_sets_from_bundle() {
        let bundle: Bundle = serde_json::from_value(serde_json::json!({
            "applications": [
                {"application": {"id": "app1"}, "latestRelease": {"config": {"svcA": {}}}},
                {"application": {"id": "app2"}}
            ]
        }))
        .unwrap();

        let apps = bundle.desired_applications();
        assert_eq!(apps.len(), 2);
        assert!(apps.contains(&ApplicationId::parse("app2").unwrap()));

        let services = bundle.desired_services();
        let key = |a: &str, s: &str| {
            ServiceKey::new(ApplicationId::parse(a).unwrap(), ServiceName::parse(s).unwrap())
        };
        assert!(services.contains(&key("app1", "svcA")));
        assert!(!services.contains(&key("app1", "svcB")));
        assert!(!services.contains(&key("app2", "svcA")));
    }

    #[test]
    fn test_unknown_service_state_kept_verbatim() {
        let json = serde_json::json!({
            "applicationId": "app1",
            "service": "web",
            "state": "hibernating",
            "errorMessage": "",
        });
        let state: ServiceState = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(state.state, ServiceStateKind::Other("hibernating".to_string()));
        assert_eq!(state.state.to_string(), "hibernating");
        assert_eq!(serde_json::to_value(&state).unwrap(), json);
    }

    #[test]
    fn test_missing_service_state_is_unknown() {
        let state: ServiceState =
            serde_json::from_str(r#"{"applicationId": "app1", "service": "web", "state": null}"#)
                .unwrap();
        assert_eq!(state.state, ServiceStateKind::Unknown);
    }

    #[test]
    fn test_invalid_entries_are_skipped() {
        let bundle: Bundle = serde_json::from_value(serde_json::json!({
            "applications": [
                {"application": {"id": "app 1"}},
                {
                    "application": {"id": "app2"},
                    "latestRelease": {"config": {"web": {}, "bad%name": {}}}
                }
            ],
            "applicationStatuses": [
                {"applicationId": "app 1"},
                {"applicationId": "app2", "currentReleaseId": "r1"}
            ],
            "serviceStatuses": [{"applicationId": "app2", "service": "a/b"}],
            "serviceStates": [
                {"applicationId": "app2", "service": "bad name", "state": "running"},
                {"applicationId": "app2", "service": "web", "state": "running"}
            ]
        }))
        .unwrap();

        assert_eq!(bundle.applications.len(), 1);
        assert_eq!(bundle.applications[0].application.id.as_str(), "app2");
        let services: Vec<_> = bundle.applications[0].service_names().collect();
        assert_eq!(services, vec![ServiceName::parse("web").unwrap()]);
        assert_eq!(bundle.application_statuses.len(), 1);
        assert!(bundle.service_statuses.is_empty());
        assert_eq!(bundle.service_states.len(), 1);
        assert_eq!(bundle.service_states[0].service.as_str(), "web");
    }

    #[test]
    fn test_malformed_application_still_fails_bundle() {
        let result = serde_json::from_value::<Bundle>(serde_json::json!({
            "applications": [{"application": {"name": "no id"}}]
        }));
        assert!(result.is_err());
    }

    #[test]
    fn test_service_state_report_serialization() {
        let report = ServiceStateReport {
            state: ServiceStateKind::PullingImage,
            error_message: String::new(),
        };
        let json = serde_json::to_string(&report).unwrap();
        assert_eq!(json, r#"{"state":"pulling image"}"#);
    }

    #[test]
    fn test_register_request_serialization() {
        let request = RegisterDeviceRequest {
            device_registration_token_id: "T",
        };
        assert_eq!(
            serde_json::to_string(&request).unwrap(),
            r#"{"deviceRegistrationTokenId":"T"}"#
        );
    }

    #[test]
    fn test_register_response_debug_redacts_key() {
        let response: RegisterDeviceResponse =
            serde_json::from_str(r#"{"deviceId": "d", "accessKey": "k-secret"}"#).unwrap();
        assert!(!format!("{response:?}").contains("k-secret"));
    }
}

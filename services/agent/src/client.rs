//! Controller API client for the device agent.
//!
//! Provides typed operations over [`Transport`]:
//! - Device registration
//! - Fetching the desired bundle
//! - Pushing device info, metrics, statuses and states
//! - Deleting orphaned statuses and states
//! - Opening the reverse tunnel and dialing back on request

use std::sync::Arc;

use bytes::Bytes;
use deviceplane_id::{ApplicationId, ProjectId};
use deviceplane_reconcile::ServiceKey;
use reqwest::Method;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

use crate::identity::Identity;
use crate::models::{
    ApplicationStatusReport, Bundle, DeviceInfo, RegisterDeviceRequest, RegisterDeviceResponse,
    ServiceStateReport, ServiceStatusReport,
};
use crate::transport::{Auth, RequestContext, Transport, TransportError, WebSocketConnection};

/// Errors from controller operations.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("failed to decode {what} response: {source}")]
    Decode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode request body: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("device is not registered")]
    NotRegistered,
}

impl ClientError {
    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_canceled())
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::Transport(e) if e.is_not_found())
    }
}

/// Join `segments` onto `base` with `/`.
pub fn get_url(base: &str, segments: &[&str]) -> String {
    let mut url = String::from(base);
    for segment in segments {
        url.push('/');
        url.push_str(segment);
    }
    url
}

/// Like [`get_url`], with the scheme rewritten for WebSockets: `http`
/// becomes `ws`, anything else becomes `wss`.
pub fn get_websocket_url(base: &str, segments: &[&str]) -> Result<String, TransportError> {
    let url = get_url(base, segments);
    let Some((scheme, rest)) = url.split_once("://") else {
        return Err(TransportError::InvalidUrl {
            url,
            reason: "missing scheme".to_string(),
        });
    };

    let ws_scheme = if scheme.eq_ignore_ascii_case("http") {
        "ws"
    } else {
        "wss"
    };
    Ok(format!("{ws_scheme}://{rest}"))
}

/// Controller API client.
///
/// Cheap to clone. Authenticated operations require an identity installed
/// with [`ControllerClient::with_identity`].
#[derive(Debug, Clone)]
pub struct ControllerClient {
    transport: Transport,
    base_url: String,
    project_id: ProjectId,
    identity: Option<Arc<Identity>>,
}

impl ControllerClient {
    /// Create a client for `base_url` (e.g. `https://cloud.deviceplane.com:443/api`).
    pub fn new(transport: Transport, base_url: &str, project_id: ProjectId) -> Self {
        Self {
            transport,
            base_url: base_url.trim_end_matches('/').to_string(),
            project_id,
            identity: None,
        }
    }

    /// Return a client that authenticates as `identity`.
    pub fn with_identity(mut self, identity: Arc<Identity>) -> Self {
        self.identity = Some(identity);
        self
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_deref()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Register the device with a registration token.
    pub async fn register_device(
        &self,
        ctx: &RequestContext,
        registration_token: &str,
    ) -> Result<RegisterDeviceResponse, ClientError> {
        let url = get_url(
            &self.base_url,
            &["projects", self.project_id.as_str(), "devices", "register"],
        );
        let request = RegisterDeviceRequest {
            device_registration_token_id: registration_token,
        };

        debug!(project_id = %self.project_id, "Registering device");
        let body = self
            .send(ctx, Method::POST, &url, &Auth::None, Some(&request), "register")
            .await?;
        decode(&body, "register")
    }

    /// Fetch the desired bundle for this device.
    pub async fn get_bundle(&self, ctx: &RequestContext) -> Result<Bundle, ClientError> {
        let (url, auth) = self.device_request(&["bundle"])?;
        let body = self
            .send(ctx, Method::GET, &url, &auth, None::<&()>, "bundle")
            .await?;
        let bundle: Bundle = decode_or_default(&body, "bundle")?;

        debug!(
            application_count = bundle.applications.len(),
            application_status_count = bundle.application_statuses.len(),
            service_status_count = bundle.service_statuses.len(),
            service_state_count = bundle.service_states.len(),
            "Fetched bundle"
        );
        Ok(bundle)
    }

    pub async fn set_device_info(
        &self,
        ctx: &RequestContext,
        info: &DeviceInfo,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.device_request(&["info"])?;
        self.send(ctx, Method::POST, &url, &auth, Some(info), "info")
            .await?;
        Ok(())
    }

    pub async fn send_device_metrics(
        &self,
        ctx: &RequestContext,
        metrics: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.device_request(&["forwardmetrics", "device"])?;
        self.send(ctx, Method::POST, &url, &auth, Some(metrics), "device metrics")
            .await?;
        Ok(())
    }

    pub async fn send_service_metrics(
        &self,
        ctx: &RequestContext,
        metrics: &serde_json::Value,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.device_request(&["forwardmetrics", "service"])?;
        self.send(ctx, Method::POST, &url, &auth, Some(metrics), "service metrics")
            .await?;
        Ok(())
    }

    pub async fn set_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
        status: &ApplicationStatusReport,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.application_status_request(application_id)?;
        self.send(ctx, Method::POST, &url, &auth, Some(status), "application status")
            .await?;
        Ok(())
    }

    /// Delete the stored application status. A missing status counts as
    /// deleted.
    pub async fn delete_application_status(
        &self,
        ctx: &RequestContext,
        application_id: &ApplicationId,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.application_status_request(application_id)?;
        self.delete(ctx, &url, &auth).await
    }

    pub async fn set_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        status: &ServiceStatusReport,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.service_request(key, "deviceservicestatuses")?;
        self.send(ctx, Method::POST, &url, &auth, Some(status), "service status")
            .await?;
        Ok(())
    }

    /// Delete the stored service status. A missing status counts as deleted.
    pub async fn delete_service_status(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.service_request(key, "deviceservicestatuses")?;
        self.delete(ctx, &url, &auth).await
    }

    pub async fn set_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
        state: &ServiceStateReport,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.service_request(key, "deviceservicestates")?;
        self.send(ctx, Method::POST, &url, &auth, Some(state), "service state")
            .await?;
        Ok(())
    }

    /// Delete the stored service state. A missing state counts as deleted.
    pub async fn delete_service_state(
        &self,
        ctx: &RequestContext,
        key: &ServiceKey,
    ) -> Result<(), ClientError> {
        let (url, auth) = self.service_request(key, "deviceservicestates")?;
        self.delete(ctx, &url, &auth).await
    }

    /// Open the persistent reverse tunnel to the controller.
    pub async fn open_reverse_tunnel(
        &self,
        ctx: &RequestContext,
    ) -> Result<WebSocketConnection, ClientError> {
        let (identity, device_id) = self.require_identity()?;
        let url = get_websocket_url(
            &self.base_url,
            &[
                "projects",
                self.project_id.as_str(),
                "devices",
                device_id,
                "connection",
            ],
        )?;

        let (conn, _headers) = self
            .transport
            .dial_websocket(ctx, &url, &basic_auth(identity))
            .await?;
        Ok(conn)
    }

    /// Dial back to the controller at a path it supplied over the tunnel.
    pub async fn reverse_dial(
        &self,
        ctx: &RequestContext,
        path: &str,
    ) -> Result<WebSocketConnection, ClientError> {
        let (identity, _) = self.require_identity()?;
        let url = get_websocket_url(&self.base_url, &[path.trim_start_matches('/')])?;

        let (conn, _headers) = self
            .transport
            .dial_websocket(ctx, &url, &basic_auth(identity))
            .await?;
        Ok(conn)
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    fn require_identity(&self) -> Result<(&Identity, &str), ClientError> {
        let identity = self.identity.as_deref().ok_or(ClientError::NotRegistered)?;
        Ok((identity, identity.device_id.as_str()))
    }

    /// URL under `/projects/{project}/devices/{device}` plus auth.
    fn device_request(&self, segments: &[&str]) -> Result<(String, Auth), ClientError> {
        let (identity, device_id) = self.require_identity()?;
        let mut all = vec!["projects", self.project_id.as_str(), "devices", device_id];
        all.extend_from_slice(segments);
        Ok((get_url(&self.base_url, &all), basic_auth(identity)))
    }

    fn application_status_request(
        &self,
        application_id: &ApplicationId,
    ) -> Result<(String, Auth), ClientError> {
        self.device_request(&[
            "applications",
            application_id.as_str(),
            "deviceapplicationstatuses",
        ])
    }

    fn service_request(
        &self,
        key: &ServiceKey,
        collection: &str,
    ) -> Result<(String, Auth), ClientError> {
        self.device_request(&[
            "applications",
            key.application_id.as_str(),
            "services",
            key.service.as_str(),
            collection,
        ])
    }

    /// Send a request with an optional JSON body and return the raw 2xx body.
    async fn send<B>(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: &str,
        auth: &Auth,
        body: Option<&B>,
        what: &'static str,
    ) -> Result<Bytes, ClientError>
    where
        B: Serialize + ?Sized,
    {
        let body = body
            .map(serde_json::to_vec)
            .transpose()
            .map_err(ClientError::Encode)?;

        match self.transport.do_request(ctx, method, url, auth, body).await {
            Ok(response) => Ok(response.body),
            Err(e) => {
                // Callers decide how loud a failure is.
                if let TransportError::HttpStatus { status, body } = &e {
                    debug!(status = %status, body = %body, what, "Controller request failed");
                }
                Err(e.into())
            }
        }
    }

    async fn delete(&self, ctx: &RequestContext, url: &str, auth: &Auth) -> Result<(), ClientError> {
        match self
            .transport
            .do_request(ctx, Method::DELETE, url, auth, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) if e.is_not_found() => {
                debug!(url = %url, "Observation already deleted");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn decode<T: DeserializeOwned>(body: &[u8], what: &'static str) -> Result<T, ClientError> {
    serde_json::from_slice(body).map_err(|source| ClientError::Decode { what, source })
}

/// Like [`decode`], but an empty body yields `T::default()`.
fn decode_or_default<T: DeserializeOwned + Default>(
    body: &[u8],
    what: &'static str,
) -> Result<T, ClientError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    decode(body, what)
}

fn basic_auth(identity: &Identity) -> Auth {
    Auth::Basic {
        username: identity.access_key.expose().to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    use crate::identity::AccessKey;

    #[rstest]
    #[case("https://ctl/api", &["projects", "p", "devices", "register"], "https://ctl/api/projects/p/devices/register")]
    #[case("http://localhost:8080", &["a", "b", "c"], "http://localhost:8080/a/b/c")]
    #[case("http://x", &[], "http://x")]
    fn test_get_url(#[case] base: &str, #[case] segments: &[&str], #[case] expected: &str) {
        assert_eq!(get_url(base, segments), expected);
    }

    #[rstest]
    #[case("http://ctl/api", "ws://ctl/api/a/b")]
    #[case("https://ctl:443/api", "wss://ctl:443/api/a/b")]
    #[case("HTTP://ctl", "ws://ctl/a/b")]
    #[case("ftp://ctl", "wss://ctl/a/b")]
    fn test_get_websocket_url(#[case] base: &str, #[case] expected: &str) {
        assert_eq!(get_websocket_url(base, &["a", "b"]).unwrap(), expected);
    }

    #[test]
    fn test_websocket_url_requires_scheme() {
        assert!(get_websocket_url("ctl/api", &["a"]).is_err());
    }

    #[tokio::test]
    async fn test_authenticated_call_requires_identity() {
        let client = ControllerClient::new(
            Transport::new().unwrap(),
            "http://127.0.0.1:9",
            ProjectId::parse("prj_1").unwrap(),
        );

        let err = client
            .get_bundle(&RequestContext::detached())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::NotRegistered));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = ControllerClient::new(
            Transport::new().unwrap(),
            "https://ctl/api/",
            ProjectId::parse("prj_1").unwrap(),
        )
        .with_identity(Arc::new(Identity {
            device_id: "dev_1".parse().unwrap(),
            access_key: AccessKey::new("k"),
        }));

        let (url, auth) = client.device_request(&["bundle"]).unwrap();
        assert_eq!(url, "https://ctl/api/projects/prj_1/devices/dev_1/bundle");
        assert_eq!(
            auth,
            Auth::Basic {
                username: "k".to_string()
            }
        );
    }
}

//! Scoped HTTP and WebSocket primitives.
//!
//! Every call takes a [`RequestContext`] that carries the agent's shutdown
//! signal and an optional deadline. Cancelling the context aborts in-flight
//! I/O. Transport never interprets bodies; callers attach authentication and
//! decode payloads themselves.

use std::fmt;
use std::future::Future;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::{Method, StatusCode};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

/// Default timeout applied by the underlying HTTP client.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// Errors from transport operations.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("network error: {0}")]
    Network(#[source] reqwest::Error),

    #[error("request timed out")]
    Timeout,

    #[error("request canceled")]
    Canceled,

    #[error("HTTP {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    #[error("invalid URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("websocket error: {0}")]
    WebSocket(#[source] Box<tungstenite::Error>),
}

impl TransportError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::Timeout
        } else {
            Self::Network(err)
        }
    }

    /// HTTP status of a non-2xx response, if that is what this error is.
    pub fn status(&self) -> Option<StatusCode> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(StatusCode::NOT_FOUND)
    }

    pub fn is_canceled(&self) -> bool {
        matches!(self, Self::Canceled)
    }

    /// Returns true if retrying the same request later may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Network(_) | Self::Timeout | Self::WebSocket(_) => true,
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Canceled | Self::InvalidUrl { .. } => false,
        }
    }
}

impl From<tungstenite::Error> for TransportError {
    fn from(err: tungstenite::Error) -> Self {
        match err {
            tungstenite::Error::Http(response) => {
                let status = response.status();
                let body = response
                    .body()
                    .as_deref()
                    .map(|b| String::from_utf8_lossy(b).into_owned())
                    .unwrap_or_default();
                Self::HttpStatus { status, body }
            }
            other => Self::WebSocket(Box::new(other)),
        }
    }
}

// =============================================================================
// Request context
// =============================================================================

/// Cancellation and deadline scope for a transport call.
///
/// A context is derived from the agent's shutdown channel. A dropped
/// shutdown sender counts as cancellation.
#[derive(Debug, Clone)]
pub struct RequestContext {
    shutdown: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

impl RequestContext {
    /// Create a context cancelled when `shutdown` flips to `true`.
    pub fn new(shutdown: watch::Receiver<bool>) -> Self {
        Self {
            shutdown: Some(shutdown),
            deadline: None,
        }
    }

    /// A context that is never cancelled and has no deadline.
    pub fn detached() -> Self {
        Self {
            shutdown: None,
            deadline: None,
        }
    }

    /// Derive a child context whose deadline is `min(parent, now + timeout)`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(parent) if parent < candidate => parent,
            _ => candidate,
        };

        Self {
            shutdown: self.shutdown.clone(),
            deadline: Some(deadline),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Check if cancellation has been signalled.
    pub fn is_cancelled(&self) -> bool {
        match &self.shutdown {
            Some(rx) => *rx.borrow() || rx.has_changed().is_err(),
            None => false,
        }
    }

    /// Resolve once the context is cancelled. Never resolves for detached
    /// contexts.
    pub async fn cancelled(&self) {
        let Some(rx) = &self.shutdown else {
            return std::future::pending().await;
        };

        let mut rx = rx.clone();
        // Err means the sender is gone, which is treated as cancellation.
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Run `fut` to completion unless the context is cancelled or its
    /// deadline passes first.
    pub async fn run<F>(&self, fut: F) -> Result<F::Output, TransportError>
    where
        F: Future,
    {
        if self.is_cancelled() {
            return Err(TransportError::Canceled);
        }

        let deadline = async {
            match self.deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancelled() => Err(TransportError::Canceled),
            _ = deadline => Err(TransportError::Timeout),
            output = fut => Ok(output),
        }
    }

    /// Sleep for `duration`, returning early with `Canceled` on shutdown.
    pub async fn sleep(&self, duration: Duration) -> Result<(), TransportError> {
        self.run(tokio::time::sleep(duration)).await
    }
}

// =============================================================================
// Authentication
// =============================================================================

/// Authentication attached to a request.
#[derive(Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    /// HTTP Basic with the given username and an empty password.
    Basic { username: String },
}

impl Auth {
    fn header_value(&self) -> Option<HeaderValue> {
        match self {
            Auth::None => None,
            Auth::Basic { username } => {
                let encoded = BASE64.encode(format!("{username}:"));
                let mut value = HeaderValue::from_str(&format!("Basic {encoded}")).ok()?;
                value.set_sensitive(true);
                Some(value)
            }
        }
    }
}

impl fmt::Debug for Auth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Auth::None => f.write_str("None"),
            Auth::Basic { .. } => f.write_str("Basic(<redacted>)"),
        }
    }
}

// =============================================================================
// HTTP
// =============================================================================

/// A fully read 2xx response.
#[derive(Debug, Clone)]
pub struct RawResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// HTTP and WebSocket transport.
#[derive(Debug, Clone)]
pub struct Transport {
    http: reqwest::Client,
}

impl Transport {
    /// Create a transport with the default request timeout.
    pub fn new() -> Result<Self, TransportError> {
        Self::with_timeout(DEFAULT_HTTP_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("deviceplane-agent/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(TransportError::Network)?;

        Ok(Self { http })
    }

    /// Issue an HTTP request and read the whole response body.
    ///
    /// Non-2xx responses are returned as [`TransportError::HttpStatus`] with
    /// the body attached.
    pub async fn do_request(
        &self,
        ctx: &RequestContext,
        method: Method,
        url: &str,
        auth: &Auth,
        body: Option<Vec<u8>>,
    ) -> Result<RawResponse, TransportError> {
        let parsed = reqwest::Url::parse(url).map_err(|e| TransportError::InvalidUrl {
            url: url.to_string(),
            reason: e.to_string(),
        })?;

        debug!(method = %method, url = %parsed, "Sending request");

        let mut request = self.http.request(method, parsed);
        if let Some(value) = auth.header_value() {
            request = request.header(AUTHORIZATION, value);
        }
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
                .body(body);
        }

        let exchange = async {
            let response = request.send().await?;
            let status = response.status();
            let headers = response.headers().clone();
            let body = response.bytes().await?;
            Ok::<_, reqwest::Error>(RawResponse {
                status,
                headers,
                body,
            })
        };

        let response = ctx
            .run(exchange)
            .await?
            .map_err(TransportError::from_reqwest)?;

        if !response.status.is_success() {
            return Err(TransportError::HttpStatus {
                status: response.status,
                body: String::from_utf8_lossy(&response.body).into_owned(),
            });
        }

        Ok(response)
    }

    /// Open a WebSocket and return the connection with the upgrade
    /// response headers.
    pub async fn dial_websocket(
        &self,
        ctx: &RequestContext,
        url: &str,
        auth: &Auth,
    ) -> Result<(WebSocketConnection, HeaderMap), TransportError> {
        let mut request = url.into_client_request()?;
        if let Some(value) = auth.header_value() {
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        debug!(url = %url, "Dialing websocket");

        let (stream, response) = ctx
            .run(tokio_tungstenite::connect_async(request))
            .await??;

        Ok((WebSocketConnection { stream }, response.headers().clone()))
    }
}

// =============================================================================
// WebSocket
// =============================================================================

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Bidirectional message stream over a WebSocket.
///
/// Payloads are carried as binary frames. Text frames are surfaced as their
/// UTF-8 bytes; ping/pong is handled internally.
pub struct WebSocketConnection {
    stream: WsStream,
}

impl WebSocketConnection {
    pub async fn send(&mut self, data: impl Into<Bytes>) -> Result<(), TransportError> {
        self.stream.send(Message::binary(data)).await?;
        Ok(())
    }

    /// Receive the next payload. Returns `None` once the peer closed the
    /// stream.
    pub async fn recv(&mut self) -> Result<Option<Bytes>, TransportError> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Binary(data) => return Ok(Some(data)),
                Message::Text(text) => return Ok(Some(Bytes::copy_from_slice(text.as_bytes()))),
                Message::Close(_) => return Ok(None),
                Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => continue,
            }
        }

        Ok(None)
    }

    pub async fn close(mut self) -> Result<(), TransportError> {
        match self.stream.close(None).await {
            Ok(()) => Ok(()),
            Err(tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

impl fmt::Debug for WebSocketConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WebSocketConnection").finish_non_exhaustive()
    }
}

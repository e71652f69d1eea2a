//! Core transport abstractions and types.

use std::{
    future::Future,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;

use crate::{
    auth::RpcAuth,
    error::{TransportError, TransportResult},
    state::{ConnectionState, StateCallback},
};

/// A single call issued by a caller.
///
/// `method` is either an RPC name such as `"Switch.Set"` or a literal path
/// such as `"/status"` for legacy REST devices.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: String,
    pub params: Option<Box<RawValue>>,
    pub id: Option<u64>,
    pub auth: Option<RpcAuth>,
    pub jsonrpc: Option<String>,
    /// Deadline for the whole call, retries included.
    pub timeout: Option<Duration>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            id: None,
            auth: None,
            jsonrpc: None,
            timeout: None,
        }
    }

    /// Set already-serialized parameters.
    #[must_use]
    pub fn params_raw(mut self, params: Box<RawValue>) -> Self {
        self.params = Some(params);
        self
    }

    /// Serialize `params` and attach them.
    pub fn params<T: Serialize>(mut self, params: &T) -> TransportResult<Self> {
        self.params = Some(serde_json::value::to_raw_value(params)?);
        Ok(self)
    }

    #[must_use]
    pub fn id(mut self, id: u64) -> Self {
        self.id = Some(id);
        self
    }

    #[must_use]
    pub fn auth(mut self, auth: RpcAuth) -> Self {
        self.auth = Some(auth);
        self
    }

    #[must_use]
    pub fn jsonrpc(mut self, version: impl Into<String>) -> Self {
        self.jsonrpc = Some(version.into());
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// RPC names are dot-qualified; anything starting with `/` is a path.
    pub fn is_rpc_method(&self) -> bool {
        !self.method.starts_with('/') && self.method.contains('.')
    }

    /// Serialize the request as a JSON envelope.
    ///
    /// `id` overrides the request's own id; `src` names the reply address
    /// for pub/sub and socket transports.
    pub fn to_envelope(&self, id: Option<u64>, src: Option<&str>) -> TransportResult<Vec<u8>> {
        let envelope = Envelope {
            id: id.or(self.id),
            src,
            method: &self.method,
            params: self.params.as_deref(),
            auth: self.auth.as_ref(),
            jsonrpc: self.jsonrpc.as_deref(),
        };
        Ok(serde_json::to_vec(&envelope)?)
    }
}

#[derive(Serialize)]
struct Envelope<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    jsonrpc: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    src: Option<&'a str>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<&'a RawValue>,
    #[serde(skip_serializing_if = "Option::is_none")]
    auth: Option<&'a RpcAuth>,
}

/// Error object carried in a response envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i64,
    #[serde(default)]
    pub message: String,
}

impl From<RpcError> for TransportError {
    fn from(err: RpcError) -> Self {
        match err.code {
            401 => TransportError::Auth {
                message: err.message,
            },
            404 => TransportError::NotFound {
                resource: err.message,
            },
            code => TransportError::Rpc {
                code,
                message: err.message,
            },
        }
    }
}

/// A response to a correlated call.
#[derive(Debug, Clone)]
pub struct RpcResponse {
    pub id: u64,
    pub src: Option<String>,
    pub dst: Option<String>,
    pub result: Option<Box<RawValue>>,
    pub error: Option<RpcError>,
}

impl RpcResponse {
    /// Raw `result` bytes, or the typed error the device returned.
    pub fn into_result(self) -> TransportResult<Bytes> {
        if let Some(error) = self.error {
            return Err(error.into());
        }
        Ok(match self.result {
            Some(raw) => Bytes::from(raw.get().to_owned()),
            None => Bytes::from_static(b"null"),
        })
    }
}

/// An unsolicited message pushed by a device.
#[derive(Debug, Clone)]
pub struct Notification {
    pub method: String,
    pub params: Option<Box<RawValue>>,
    /// Device identifier, when the frame carries one.
    pub src: Option<String>,
    /// Network address the frame arrived from.
    pub source: Option<SocketAddr>,
}

impl Notification {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: None,
            src: None,
            source: None,
        }
    }

    /// Params as a string slice, `"null"` when absent.
    pub fn params_str(&self) -> &str {
        self.params.as_deref().map_or("null", RawValue::get)
    }
}

/// Callback receiving notifications. Runs on the transport's reader task.
pub type NotificationHandler = Arc<dyn Fn(&Notification) + Send + Sync>;

/// Classification of an inbound frame.
#[derive(Debug)]
pub enum MessageKind {
    /// Reply to a call, correlated by id.
    Response(RpcResponse),
    /// Server push.
    Notification(Notification),
    /// Neither; logged and dropped by the reader.
    Unknown,
}

#[derive(Deserialize)]
struct InboundFrame {
    #[serde(default)]
    id: Option<u64>,
    #[serde(default)]
    src: Option<String>,
    #[serde(default)]
    dst: Option<String>,
    #[serde(default)]
    method: Option<String>,
    #[serde(default)]
    params: Option<Box<RawValue>>,
    #[serde(default)]
    result: Option<Box<RawValue>>,
    #[serde(default)]
    error: Option<RpcError>,
}

/// Decode and classify a JSON frame.
///
/// A frame with a non-zero id is a response; a frame with a method and no
/// id is a notification.
pub fn classify_frame(bytes: &[u8]) -> TransportResult<MessageKind> {
    let frame: InboundFrame = serde_json::from_slice(bytes)?;

    match (frame.id, frame.method) {
        (Some(id), _) if id != 0 => Ok(MessageKind::Response(RpcResponse {
            id,
            src: frame.src,
            dst: frame.dst,
            result: frame.result,
            error: frame.error,
        })),
        (None | Some(0), Some(method)) => Ok(MessageKind::Notification(Notification {
            method,
            params: frame.params,
            src: frame.src,
            source: None,
        })),
        _ => Ok(MessageKind::Unknown),
    }
}

/// Run `fut` under an optional caller deadline.
pub(crate) async fn with_deadline<F, T>(deadline: Option<Duration>, fut: F) -> TransportResult<T>
where
    F: Future<Output = TransportResult<T>>,
{
    match deadline {
        Some(duration) => tokio::time::timeout(duration, fut)
            .await
            .map_err(|_| TransportError::DeadlineExceeded { duration })?,
        None => fut.await,
    }
}

/// The contract every transport satisfies.
///
/// Optional behaviour is exposed through the capability accessors, which
/// default to `None`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Issue `request` and return the raw result payload.
    async fn call(&self, request: Request) -> TransportResult<Bytes>;

    /// Release resources and fail pending calls. Idempotent.
    async fn close(&self) -> TransportResult<()>;

    fn as_subscriber(&self) -> Option<&dyn Subscriber> {
        None
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        None
    }

    fn as_connectable(&self) -> Option<&dyn Connectable> {
        None
    }

    /// Counters for monitoring.
    fn metrics(&self) -> TransportMetrics {
        TransportMetrics::default()
    }
}

/// Transports that deliver push notifications to a single handler.
pub trait Subscriber: Send + Sync {
    /// Fails with [`TransportError::HandlerAlreadyRegistered`] if a handler
    /// is already active.
    fn subscribe(&self, handler: NotificationHandler) -> TransportResult<()>;

    fn unsubscribe(&self);
}

/// Transports with an observable connection state.
pub trait Stateful: Send + Sync {
    fn state(&self) -> ConnectionState;

    fn on_state_change(&self, callback: StateCallback);
}

/// Transports with explicit connection setup.
#[async_trait]
pub trait Connectable: Send + Sync {
    async fn connect(&self) -> TransportResult<()>;
}

/// Transport metrics for monitoring and observability.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransportMetrics {
    /// Total number of calls issued
    pub requests_sent: u64,

    /// Calls that returned a result
    pub requests_successful: u64,

    /// Calls that returned an error
    pub requests_failed: u64,

    /// Extra attempts made by the retry loop
    pub retries: u64,
}

impl TransportMetrics {
    /// Calculate the success rate.
    pub fn success_rate(&self) -> f64 {
        if self.requests_sent == 0 {
            0.0
        } else {
            self.requests_successful as f64 / self.requests_sent as f64
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct MetricsCounters {
    sent: AtomicU64,
    successful: AtomicU64,
    failed: AtomicU64,
    retries: AtomicU64,
}

impl MetricsCounters {
    pub(crate) fn record<T>(&self, result: &TransportResult<T>) {
        self.sent.fetch_add(1, Ordering::Relaxed);
        if result.is_ok() {
            self.successful.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[cfg_attr(not(feature = "http"), allow(dead_code))]
    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> TransportMetrics {
        TransportMetrics {
            requests_sent: self.sent.load(Ordering::Relaxed),
            requests_successful: self.successful.load(Ordering::Relaxed),
            requests_failed: self.failed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
        }
    }
}

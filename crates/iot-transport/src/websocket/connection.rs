//! WebSocket transport.
//!
//! Each live connection owns a reader task and an optional keepalive task,
//! both stopped through a per-connection watch signal. When the reader sees
//! the socket fail it reports the loss to a supervisor task, which fails the
//! pending calls and runs the reconnect loop.

use std::{
    sync::{
        Arc, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use tokio::{
    net::TcpStream,
    sync::{Mutex as AsyncMutex, mpsc, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::AUTHORIZATION},
    },
};
use tracing::{debug, info, warn};

use super::config::WsConfig;
use crate::{
    auth::basic_authorization,
    error::{TransportError, TransportResult},
    pending::PendingRequests,
    state::{ConnectionState, StateCallback, StateMachine},
    subscription::HandlerSlot,
    transport::{
        Connectable, MessageKind, MetricsCounters, NotificationHandler, Request, Stateful,
        Subscriber, Transport, TransportMetrics, classify_frame, with_deadline,
    },
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsRead = SplitStream<WsStream>;

/// Grace period for the close handshake on shutdown.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

/// Reported by a reader task when its socket fails.
#[derive(Debug)]
struct ConnectionLoss {
    epoch: u64,
    reason: String,
}

/// Handles of one established connection.
struct ActiveConnection {
    epoch: u64,
    sink: Arc<AsyncMutex<WsSink>>,
    stop: watch::Sender<bool>,
    reader: JoinHandle<()>,
    keepalive: Option<JoinHandle<()>>,
}

impl ActiveConnection {
    /// Stop both workers and wait for them to finish.
    async fn stop_workers(self) {
        let _ = self.stop.send(true);
        if let Some(keepalive) = self.keepalive {
            let _ = keepalive.await;
        }
        let _ = self.reader.await;
    }

    /// Send a close frame, then stop the workers.
    async fn shutdown(self) {
        let _ = self.stop.send(true);
        {
            let mut sink = self.sink.lock().await;
            if let Err(err) = timeout(CLOSE_TIMEOUT, sink.close()).await.unwrap_or(Ok(())) {
                debug!(error = %err, "close handshake failed");
            }
        }
        self.stop_workers().await;
    }
}

/// Reader task inputs.
struct ReaderContext {
    epoch: u64,
    pending: PendingRequests,
    handler: Arc<HandlerSlot>,
    lost_tx: mpsc::UnboundedSender<ConnectionLoss>,
    max_message_size: usize,
}

impl ReaderContext {
    /// Route one inbound payload. Malformed frames are dropped.
    fn dispatch(&self, payload: &[u8]) {
        if self.max_message_size > 0 && payload.len() > self.max_message_size {
            warn!(
                size = payload.len(),
                max = self.max_message_size,
                "Dropping oversized WebSocket message"
            );
            return;
        }

        match classify_frame(payload) {
            Ok(MessageKind::Response(response)) => {
                let id = response.id;
                if !self.pending.resolve(response) {
                    debug!(id, "no pending call for response");
                }
            }
            Ok(MessageKind::Notification(notification)) => {
                self.handler.dispatch(&notification);
            }
            Ok(MessageKind::Unknown) => {
                debug!("ignoring frame that is neither response nor notification");
            }
            Err(err) => {
                debug!(error = %err, "dropping malformed frame");
            }
        }
    }

    async fn run(self, mut read: WsRead, mut stop: watch::Receiver<bool>) {
        let reason = loop {
            tokio::select! {
                _ = stop.changed() => return,
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => self.dispatch(text.as_bytes()),
                    Some(Ok(Message::Binary(data))) => self.dispatch(&data),
                    Some(Ok(Message::Close(frame))) => {
                        break match frame {
                            Some(frame) => format!("closed by peer: {} {}", frame.code, frame.reason),
                            None => "closed by peer".to_string(),
                        };
                    }
                    Some(Ok(_)) => {}
                    Some(Err(err)) => {
                        warn!(error = %err, "WebSocket read error");
                        break err.to_string();
                    }
                    None => break "stream ended".to_string(),
                },
            }
        };

        let _ = self.lost_tx.send(ConnectionLoss {
            epoch: self.epoch,
            reason,
        });
    }
}

async fn keepalive_task(
    sink: Arc<AsyncMutex<WsSink>>,
    interval: Duration,
    pong_timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    // first tick completes immediately
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = stop.changed() => return,
            _ = ticker.tick() => {
                let sent = timeout(pong_timeout, async {
                    sink.lock().await.send(Message::Ping(Vec::new())).await
                })
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(error = %err, "keepalive ping failed");
                        return;
                    }
                    Err(_) => {
                        debug!("keepalive ping timed out");
                        return;
                    }
                }
            }
        }
    }
}

struct Shared {
    config: WsConfig,
    state: StateMachine,
    pending: PendingRequests,
    handler: Arc<HandlerSlot>,
    connection: AsyncMutex<Option<ActiveConnection>>,
    epoch: AtomicU64,
    closed: AtomicBool,
    lost_tx: mpsc::UnboundedSender<ConnectionLoss>,
    lost_rx: parking_lot::Mutex<Option<mpsc::UnboundedReceiver<ConnectionLoss>>>,
    supervisor: parking_lot::Mutex<Option<JoinHandle<()>>>,
    metrics: MetricsCounters,
}

impl Shared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Start the supervisor on first use.
    fn ensure_supervisor(self: &Arc<Self>) {
        let Some(rx) = self.lost_rx.lock().take() else {
            return;
        };
        let handle = tokio::spawn(supervise(Arc::downgrade(self), rx));
        *self.supervisor.lock() = Some(handle);
    }

    async fn establish(&self) -> TransportResult<WsStream> {
        let config = &self.config;
        let mut request = config.url.as_str().into_client_request()?;
        if let Some(credentials) = &config.credentials {
            let value = HeaderValue::from_str(&basic_authorization(credentials))
                .map_err(|e| TransportError::config(format!("Invalid credentials: {e}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let connector = if config.insecure_tls {
            let tls = native_tls::TlsConnector::builder()
                .danger_accept_invalid_certs(true)
                .danger_accept_invalid_hostnames(true)
                .build()
                .map_err(|e| TransportError::config(format!("Failed to build TLS connector: {e}")))?;
            Some(Connector::NativeTls(tls))
        } else {
            None
        };

        let (stream, _response) = timeout(
            config.connect_timeout,
            connect_async_tls_with_config(request, None, false, connector),
        )
        .await
        .map_err(|_| TransportError::timeout(config.connect_timeout))??;

        Ok(stream)
    }

    /// Open a connection unless one is already live.
    async fn connect_inner(&self) -> TransportResult<()> {
        let mut guard = self.connection.lock().await;
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        if guard.is_some() {
            return Ok(());
        }

        let fresh = self.state.get() == ConnectionState::Disconnected;
        if fresh {
            self.state.transition(ConnectionState::Connecting);
        }

        let stream = match self.establish().await {
            Ok(stream) => stream,
            Err(err) => {
                if fresh {
                    self.state.transition(ConnectionState::Disconnected);
                }
                return Err(err);
            }
        };

        let epoch = self.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        let (sink, read) = stream.split();
        let sink = Arc::new(AsyncMutex::new(sink));
        let (stop, stop_rx) = watch::channel(false);

        let reader = ReaderContext {
            epoch,
            pending: self.pending.clone(),
            handler: Arc::clone(&self.handler),
            lost_tx: self.lost_tx.clone(),
            max_message_size: self.config.max_message_size,
        };
        let reader = tokio::spawn(reader.run(read, stop_rx.clone()));

        let keepalive = (!self.config.ping_interval.is_zero()).then(|| {
            tokio::spawn(keepalive_task(
                Arc::clone(&sink),
                self.config.ping_interval,
                self.config.pong_timeout,
                stop_rx,
            ))
        });

        *guard = Some(ActiveConnection {
            epoch,
            sink,
            stop,
            reader,
            keepalive,
        });
        drop(guard);

        self.state.transition(ConnectionState::Connected);
        info!(url = %self.config.url, epoch, "WebSocket connected");
        Ok(())
    }

    async fn current_sink(&self) -> TransportResult<Arc<AsyncMutex<WsSink>>> {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|active| Arc::clone(&active.sink))
            .ok_or(TransportError::NotConnected)
    }

    async fn handle_loss(&self, loss: ConnectionLoss) {
        let active = {
            let mut guard = self.connection.lock().await;
            if guard.as_ref().is_some_and(|active| active.epoch == loss.epoch) {
                guard.take()
            } else {
                None
            }
        };
        let Some(active) = active else {
            // superseded by close or a newer connection
            return;
        };
        active.stop_workers().await;

        let failed = self
            .pending
            .clear_with_error(|| TransportError::connection_lost(loss.reason.clone()));
        warn!(reason = %loss.reason, failed, "WebSocket connection lost");

        if self.is_closed() {
            return;
        }
        self.state.transition(ConnectionState::Disconnected);

        if self.config.auto_reconnect {
            self.reconnect_loop().await;
        }
    }

    async fn reconnect_loop(&self) {
        self.state.transition(ConnectionState::Reconnecting);
        let backoff = self.config.reconnect_backoff();

        for attempt in 0..self.config.reconnect_max_attempts {
            let delay = backoff.delay(attempt);
            debug!(attempt = attempt + 1, delay_ms = delay.as_millis() as u64, "reconnecting");
            sleep(delay).await;
            if self.is_closed() {
                return;
            }
            match self.connect_inner().await {
                Ok(()) => return,
                Err(err) => {
                    warn!(attempt = attempt + 1, error = %err, "reconnect attempt failed");
                }
            }
        }

        warn!(
            attempts = self.config.reconnect_max_attempts,
            "giving up reconnecting"
        );
        if !self.is_closed() {
            self.state.transition(ConnectionState::Disconnected);
        }
    }

    async fn call_inner(&self, request: &Request) -> TransportResult<Bytes> {
        // id 0 never correlates
        let id = request.id.filter(|&id| id != 0).unwrap_or_else(|| self.pending.next_id());
        let slot = self.pending.register(id)?;

        let payload = String::from_utf8(request.to_envelope(Some(id), Some(&self.config.client_id))?)?;
        let sink = self.current_sink().await?;
        sink.lock().await.send(Message::Text(payload)).await?;

        let response = timeout(self.config.request_timeout, slot.wait())
            .await
            .map_err(|_| TransportError::timeout(self.config.request_timeout))??;
        response.into_result()
    }
}

/// Owns reconnection; exits once the transport is dropped.
async fn supervise(shared: Weak<Shared>, mut lost_rx: mpsc::UnboundedReceiver<ConnectionLoss>) {
    while let Some(loss) = lost_rx.recv().await {
        let Some(shared) = shared.upgrade() else {
            return;
        };
        shared.handle_loss(loss).await;
    }
}

/// Persistent duplex transport with id correlation.
pub struct WsTransport {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for WsTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsTransport")
            .field("url", &self.shared.config.url)
            .field("state", &self.shared.state.get())
            .field("pending", &self.shared.pending.len())
            .finish()
    }
}

impl WsTransport {
    pub fn new(config: WsConfig) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();

        Ok(Self {
            shared: Arc::new(Shared {
                pending: PendingRequests::new(config.max_pending_requests),
                config,
                state: StateMachine::new(),
                handler: Arc::new(HandlerSlot::new()),
                connection: AsyncMutex::new(None),
                epoch: AtomicU64::new(0),
                closed: AtomicBool::new(false),
                lost_tx,
                lost_rx: parking_lot::Mutex::new(Some(lost_rx)),
                supervisor: parking_lot::Mutex::new(None),
                metrics: MetricsCounters::default(),
            }),
        })
    }

    pub fn config(&self) -> &WsConfig {
        &self.shared.config
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.len()
    }

    async fn ensure_connected(&self) -> TransportResult<()> {
        if self.shared.state.get().is_connected() {
            return Ok(());
        }
        self.connect().await
    }
}

#[async_trait]
impl Connectable for WsTransport {
    async fn connect(&self) -> TransportResult<()> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        self.shared.ensure_supervisor();
        self.shared.connect_inner().await
    }
}

#[async_trait]
impl Transport for WsTransport {
    async fn call(&self, request: Request) -> TransportResult<Bytes> {
        if self.shared.is_closed() {
            return Err(TransportError::Closed);
        }
        let result = with_deadline(request.timeout, async {
            self.ensure_connected().await?;
            self.shared.call_inner(&request).await
        })
        .await;
        self.shared.metrics.record(&result);
        result
    }

    async fn close(&self) -> TransportResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        if let Some(supervisor) = self.shared.supervisor.lock().take() {
            supervisor.abort();
        }
        let active = self.shared.connection.lock().await.take();
        if let Some(active) = active {
            active.shutdown().await;
        }

        self.shared.pending.clear_with_error(|| TransportError::Closed);
        self.shared.state.close();
        info!(url = %self.shared.config.url, "WebSocket transport closed");
        Ok(())
    }

    fn as_subscriber(&self) -> Option<&dyn Subscriber> {
        Some(self)
    }

    fn as_stateful(&self) -> Option<&dyn Stateful> {
        Some(self)
    }

    fn as_connectable(&self) -> Option<&dyn Connectable> {
        Some(self)
    }

    fn metrics(&self) -> TransportMetrics {
        self.shared.metrics.snapshot()
    }
}

impl Subscriber for WsTransport {
    fn subscribe(&self, handler: NotificationHandler) -> TransportResult<()> {
        self.shared.handler.set(handler)
    }

    fn unsubscribe(&self) {
        self.shared.handler.clear();
    }
}

impl Stateful for WsTransport {
    fn state(&self) -> ConnectionState {
        self.shared.state.get()
    }

    fn on_state_change(&self, callback: StateCallback) {
        self.shared.state.on_change(callback);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::transport::Notification;

    fn reader_context(pending: &PendingRequests, handler: &Arc<HandlerSlot>) -> ReaderContext {
        let (lost_tx, _lost_rx) = mpsc::unbounded_channel();
        ReaderContext {
            epoch: 1,
            pending: pending.clone(),
            handler: Arc::clone(handler),
            lost_tx,
            max_message_size: 64,
        }
    }

    #[tokio::test]
    async fn dispatch_routes_responses_and_notifications() {
        let pending = PendingRequests::default();
        let handler = Arc::new(HandlerSlot::new());
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        handler
            .set(Arc::new(move |n: &Notification| {
                assert_eq!(n.method, "NotifyStatus");
                counter.fetch_add(1, Ordering::SeqCst);
            }))
            .unwrap();

        let ctx = reader_context(&pending, &handler);
        let slot = pending.register(4).unwrap();

        ctx.dispatch(br#"{"method":"NotifyStatus","params":{}}"#);
        ctx.dispatch(br#"{"id":4,"result":{"ok":true}}"#);
        ctx.dispatch(br#"{"id":99,"result":null}"#);
        ctx.dispatch(b"garbage");

        assert_eq!(seen.load(Ordering::SeqCst), 1);
        let response = slot.wait().await.unwrap();
        assert_eq!(response.into_result().unwrap(), Bytes::from_static(br#"{"ok":true}"#));
    }

    #[test]
    fn dispatch_drops_oversized_frames() {
        let pending = PendingRequests::default();
        let handler = Arc::new(HandlerSlot::new());
        let ctx = reader_context(&pending, &handler);
        let _slot = pending.register(1).unwrap();

        let big = format!(r#"{{"id":1,"result":"{}"}}"#, "x".repeat(100));
        ctx.dispatch(big.as_bytes());
        assert!(pending.contains(1));
    }

    #[test]
    fn new_rejects_invalid_config() {
        assert!(matches!(
            WsTransport::new(WsConfig::new("http://device")),
            Err(TransportError::Config { .. })
        ));
    }

    #[tokio::test]
    async fn capabilities_are_exposed() {
        let transport = WsTransport::new(WsConfig::new("ws://127.0.0.1:9/rpc")).unwrap();
        assert!(transport.as_subscriber().is_some());
        assert!(transport.as_connectable().is_some());
        assert_eq!(
            transport.as_stateful().map(|s| s.state()),
            Some(ConnectionState::Disconnected)
        );
    }
}

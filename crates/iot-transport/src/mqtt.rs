//! MQTT transport: RPC over publish/subscribe.
//!
//! Requests are published to `<device>/rpc` with `src` set to the client id;
//! the device replies on `<client_id>/rpc`, and pushes events on
//! `<device>/events/rpc`. Replies are matched by id only.
//!
//! A publish counts as sent once rumqttc has queued it. Broker PUBACK is
//! not awaited; at QoS 1 and 2 delivery is only confirmed by the reply.

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Packet, QoS, TlsConfiguration,
    tokio_rustls::rustls::{
        self, ClientConfig, DigitallySignedStruct, SignatureScheme,
        client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
        pki_types::{CertificateDer, ServerName, UnixTime},
    },
};
use tokio::{
    sync::{Mutex as AsyncMutex, oneshot, watch},
    task::JoinHandle,
    time::{sleep, timeout},
};
use tracing::{debug, info, warn};

use crate::{
    auth::Credentials,
    error::{TransportError, TransportResult},
    pending::{DEFAULT_MAX_PENDING, PendingRequests},
    reconnect::BackoffConfig,
    state::{ConnectionState, StateCallback, StateMachine},
    subscription::HandlerSlot,
    transport::{
        Connectable, MessageKind, MetricsCounters, NotificationHandler, Request, Stateful,
        Subscriber, Transport, TransportMetrics, classify_frame, with_deadline,
    },
};

/// Configuration for the MQTT transport.
#[derive(Clone, Debug)]
pub struct MqttConfig {
    /// Broker host
    pub host: String,
    /// Broker port
    pub port: u16,
    /// Target device id; prefix of the request and events topics.
    pub device_id: String,
    /// Our client id; prefix of the private response topic.
    pub client_id: String,
    /// Quality of service, 0 to 2
    pub qos: u8,
    pub keep_alive: Duration,
    pub clean_session: bool,
    pub credentials: Option<Credentials>,
    /// Connect with TLS
    pub tls: bool,
    /// Accept invalid TLS certificates
    pub insecure_tls: bool,
    /// Keep polling the event loop after a connection error.
    pub auto_reconnect: bool,
    pub request_timeout: Duration,
    /// Bound on waiting for the first ConnAck.
    pub connect_timeout: Duration,
    pub reconnect_initial_delay: Duration,
    pub reconnect_max_delay: Duration,
    pub reconnect_backoff_factor: f64,
    pub max_pending_requests: usize,
    /// Capacity of the client request channel.
    pub channel_capacity: usize,
}

impl MqttConfig {
    pub fn new(
        host: impl Into<String>,
        device_id: impl Into<String>,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            host: host.into(),
            port: 1883,
            device_id: device_id.into(),
            client_id: client_id.into(),
            qos: 1,
            keep_alive: Duration::from_secs(30),
            clean_session: true,
            credentials: None,
            tls: false,
            insecure_tls: false,
            auto_reconnect: true,
            request_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            reconnect_initial_delay: Duration::from_secs(1),
            reconnect_max_delay: Duration::from_secs(30),
            reconnect_backoff_factor: 2.0,
            max_pending_requests: DEFAULT_MAX_PENDING,
            channel_capacity: 64,
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn qos(mut self, qos: u8) -> Self {
        self.qos = qos;
        self
    }

    #[must_use]
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    #[must_use]
    pub fn clean_session(mut self, clean: bool) -> Self {
        self.clean_session = clean;
        self
    }

    #[must_use]
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    #[must_use]
    pub fn tls(mut self, enabled: bool) -> Self {
        self.tls = enabled;
        self
    }

    #[must_use]
    pub fn insecure_tls(mut self, insecure: bool) -> Self {
        self.insecure_tls = insecure;
        self
    }

    #[must_use]
    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    #[must_use]
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn reconnect_backoff(mut self, initial: Duration, factor: f64, max: Duration) -> Self {
        self.reconnect_initial_delay = initial;
        self.reconnect_backoff_factor = factor;
        self.reconnect_max_delay = max;
        self
    }

    pub fn request_topic(&self) -> String {
        format!("{}/rpc", self.device_id)
    }

    pub fn response_topic(&self) -> String {
        format!("{}/rpc", self.client_id)
    }

    pub fn events_topic(&self) -> String {
        format!("{}/events/rpc", self.device_id)
    }

    pub fn qos_level(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            _ => QoS::ExactlyOnce,
        }
    }

    fn backoff(&self) -> BackoffConfig {
        BackoffConfig::exponential(
            self.reconnect_initial_delay,
            self.reconnect_backoff_factor,
            self.reconnect_max_delay,
        )
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("Broker host cannot be empty".to_string());
        }
        if self.device_id.is_empty() {
            return Err("Device id cannot be empty".to_string());
        }
        if self.client_id.is_empty() {
            return Err("Client id cannot be empty".to_string());
        }
        if self.device_id.contains(['+', '#']) || self.client_id.contains(['+', '#']) {
            return Err("Topic wildcards are not allowed in ids".to_string());
        }
        if self.qos > 2 {
            return Err(format!("Invalid QoS level: {}", self.qos));
        }
        if self.keep_alive < Duration::from_secs(5) {
            return Err("Keep alive must be >= 5s".to_string());
        }
        if self.request_timeout.is_zero() || self.connect_timeout.is_zero() {
            return Err("Timeouts must be > 0".to_string());
        }
        if self.channel_capacity == 0 || self.max_pending_requests == 0 {
            return Err("Capacities must be > 0".to_string());
        }
        if self.auto_reconnect {
            self.backoff().validate()?;
        }
        Ok(())
    }

    fn mqtt_options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(self.clean_session);
        if let Some(credentials) = &self.credentials {
            options.set_credentials(&credentials.username, &credentials.password);
        }
        if self.tls {
            let tls = if self.insecure_tls {
                TlsConfiguration::Rustls(Arc::new(insecure_client_config()))
            } else {
                TlsConfiguration::Native
            };
            options.set_transport(rumqttc::Transport::tls_with_config(tls));
        }
        options
    }
}

/// Client config that accepts any broker certificate.
fn insecure_client_config() -> ClientConfig {
    ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyCertificate))
        .with_no_client_auth()
}

#[derive(Debug)]
struct AcceptAnyCertificate;

impl ServerCertVerifier for AcceptAnyCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

/// State shared between callers and the event-loop task.
struct Core {
    config: MqttConfig,
    state: StateMachine,
    pending: PendingRequests,
    handler: HandlerSlot,
    client: parking_lot::Mutex<Option<AsyncClient>>,
    closed: AtomicBool,
    metrics: MetricsCounters,
}

impl Core {
    fn new(config: MqttConfig) -> Self {
        Self {
            pending: PendingRequests::new(config.max_pending_requests),
            config,
            state: StateMachine::new(),
            handler: HandlerSlot::new(),
            client: parking_lot::Mutex::new(None),
            closed: AtomicBool::new(false),
            metrics: MetricsCounters::default(),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Subscriptions are renewed on every ConnAck.
    fn on_connected(&self, client: &AsyncClient) {
        let qos = self.config.qos_level();
        if let Err(err) = client.try_subscribe(self.config.response_topic(), qos) {
            warn!(error = %err, "failed to subscribe response topic");
        }
        if self.handler.is_set()
            && let Err(err) = client.try_subscribe(self.config.events_topic(), qos)
        {
            warn!(error = %err, "failed to subscribe events topic");
        }
        self.state.transition(ConnectionState::Connected);
        info!(
            host = %self.config.host,
            device = %self.config.device_id,
            "MQTT connected"
        );
    }

    /// Route one inbound publish. Malformed payloads are dropped.
    fn process_publish(&self, topic: &str, payload: &[u8]) {
        match classify_frame(payload) {
            Ok(MessageKind::Response(response)) => {
                let id = response.id;
                if !self.pending.resolve(response) {
                    debug!(id, topic, "no pending call for response");
                }
            }
            Ok(MessageKind::Notification(notification)) => {
                self.handler.dispatch(&notification);
            }
            Ok(MessageKind::Unknown) => {
                debug!(topic, "ignoring publish that is neither response nor notification");
            }
            Err(err) => {
                debug!(topic, error = %err, "dropping malformed publish");
            }
        }
    }
}

async fn run_event_loop(
    core: Arc<Core>,
    mut event_loop: EventLoop,
    client: AsyncClient,
    mut stop: watch::Receiver<bool>,
    ready: oneshot::Sender<TransportResult<()>>,
) {
    let mut ready = Some(ready);
    let backoff = core.config.backoff();
    let mut attempt = 0u32;

    loop {
        let event = tokio::select! {
            _ = stop.changed() => break,
            event = event_loop.poll() => event,
        };

        match event {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                attempt = 0;
                core.on_connected(&client);
                if let Some(ready) = ready.take() {
                    let _ = ready.send(Ok(()));
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                core.process_publish(&publish.topic, &publish.payload);
            }
            Ok(_) => {}
            Err(err) => {
                let reason = err.to_string();
                let failed = core
                    .pending
                    .clear_with_error(|| TransportError::connection_lost(reason.clone()));
                warn!(error = %err, failed, "MQTT connection lost");

                if let Some(ready) = ready.take() {
                    let _ = ready.send(Err(TransportError::mqtt(reason)));
                    break;
                }
                if core.is_closed() || !core.config.auto_reconnect {
                    core.state.transition(ConnectionState::Disconnected);
                    break;
                }

                core.state.transition(ConnectionState::Reconnecting);
                let delay = backoff.delay(attempt);
                attempt = attempt.saturating_add(1);
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = sleep(delay) => {}
                }
            }
        }
    }

    core.client.lock().take();
    debug!("MQTT event loop stopped");
}

struct Worker {
    stop: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

impl Worker {
    async fn stop(self) {
        let _ = self.stop.send(true);
        let _ = self.handle.await;
    }
}

/// RPC transport over an MQTT broker.
pub struct MqttTransport {
    core: Arc<Core>,
    /// Also serializes `connect`.
    worker: AsyncMutex<Option<Worker>>,
}

impl std::fmt::Debug for MqttTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MqttTransport")
            .field("host", &self.core.config.host)
            .field("device_id", &self.core.config.device_id)
            .field("state", &self.core.state.get())
            .finish()
    }
}

impl MqttTransport {
    pub fn new(config: MqttConfig) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;
        Ok(Self {
            core: Arc::new(Core::new(config)),
            worker: AsyncMutex::new(None),
        })
    }

    pub fn config(&self) -> &MqttConfig {
        &self.core.config
    }

    pub fn pending_count(&self) -> usize {
        self.core.pending.len()
    }

    async fn call_inner(&self, request: &Request) -> TransportResult<Bytes> {
        if !self.core.state.get().is_connected() {
            self.connect().await?;
        }
        let client = self
            .core
            .client
            .lock()
            .clone()
            .ok_or(TransportError::NotConnected)?;

        let config = &self.core.config;
        let id = request
            .id
            .filter(|&id| id != 0)
            .unwrap_or_else(|| self.core.pending.next_id());
        let slot = self.core.pending.register(id)?;
        let payload = request.to_envelope(Some(id), Some(&config.client_id))?;

        // Completes once the packet is queued for the event loop, not on PUBACK.
        client
            .publish(config.request_topic(), config.qos_level(), false, payload)
            .await?;

        let response = timeout(config.request_timeout, slot.wait())
            .await
            .map_err(|_| TransportError::timeout(config.request_timeout))??;
        response.into_result()
    }
}

#[async_trait]
impl Connectable for MqttTransport {
    async fn connect(&self) -> TransportResult<()> {
        let mut worker = self.worker.lock().await;
        if self.core.is_closed() {
            return Err(TransportError::Closed);
        }
        if worker.as_ref().is_some_and(|w| !w.handle.is_finished()) {
            return Ok(());
        }
        *worker = None;

        let config = &self.core.config;
        self.core.state.transition(ConnectionState::Connecting);

        let (client, event_loop) = AsyncClient::new(config.mqtt_options(), config.channel_capacity);
        *self.core.client.lock() = Some(client.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run_event_loop(
            Arc::clone(&self.core),
            event_loop,
            client,
            stop_rx,
            ready_tx,
        ));
        let started = Worker {
            stop: stop_tx,
            handle,
        };

        let outcome = match timeout(config.connect_timeout, ready_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(TransportError::connection_lost("event loop stopped")),
            Err(_) => Err(TransportError::timeout(config.connect_timeout)),
        };

        match outcome {
            Ok(()) => {
                *worker = Some(started);
                Ok(())
            }
            Err(err) => {
                started.stop().await;
                self.core.client.lock().take();
                self.core.state.transition(ConnectionState::Disconnected);
                Err(err)
            }
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    async fn call(&self, request: Request) -> TransportResult<Bytes> {
        if self.core.is_closed() {
            return Err(TransportError::Closed);
        }
        let result = with_deadline(request.timeout, self.call_inner(&request)).await;
        self.core.metrics.record(&result);
        result
    }

    async fn close(&self) -> TransportResult<()> {
        if self.core.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        let client = self.core.client.lock().clone();
        if let Some(client) = client
            && let Err(err) = client.try_disconnect()
        {
            debug!(error = %err, "MQTT disconnect failed");
        }
        if let Some(worker) = self.worker.lock().await.take() {
            worker.stop().await;
        }

        self.core.pending.clear_with_error(|| TransportError::Closed);
        self.core.state.close();
        info!(host = %self.core.config.host, "MQTT transport closed");
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
        self.core.metrics.snapshot()
    }
}

impl Subscriber for MqttTransport {
    fn subscribe(&self, handler: NotificationHandler) -> TransportResult<()> {
        self.core.handler.set(handler)?;

        if self.core.state.get().is_connected() {
            let client = self.core.client.lock().clone();
            if let Some(client) = client
                && let Err(err) =
                    client.try_subscribe(self.core.config.events_topic(), self.core.config.qos_level())
            {
                self.core.handler.clear();
                return Err(err.into());
            }
        }
        Ok(())
    }

    fn unsubscribe(&self) {
        self.core.handler.clear();

        let client = self.core.client.lock().clone();
        if let Some(client) = client
            && let Err(err) = client.try_unsubscribe(self.core.config.events_topic())
        {
            debug!(error = %err, "failed to unsubscribe events topic");
        }
    }
}

impl Stateful for MqttTransport {
    fn state(&self) -> ConnectionState {
        self.core.state.get()
    }

    fn on_state_change(&self, callback: StateCallback) {
        self.core.state.on_change(callback);
    }
}

//! Receive-only CoIoT transport over UDP unicast or multicast.

use std::{
    net::{Ipv4Addr, SocketAddr, SocketAddrV4},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::{net::UdpSocket, sync::Mutex as AsyncMutex, task::JoinHandle, time::timeout};
use tracing::{debug, info, warn};

use super::codec::{self, CoapMessage};
use crate::{
    error::{TransportError, TransportResult},
    state::{ConnectionState, StateCallback, StateMachine},
    subscription::HandlerSlot,
    transport::{
        Connectable, Notification, NotificationHandler, Request, Stateful, Subscriber, Transport,
        TransportMetrics,
    },
};

/// Standard CoIoT multicast group.
pub const COIOT_MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(224, 0, 1, 187);
/// Standard CoAP port.
pub const COIOT_PORT: u16 = 5683;
/// Method name given to decoded status notifications.
pub const COIOT_STATUS_METHOD: &str = "CoIoT.Status";

/// Where datagrams come from.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CoapMode {
    /// Exchange datagrams with a single device.
    Unicast { device: SocketAddr },
    /// Receive broadcasts from every device on the network.
    Multicast,
}

#[derive(Clone, Debug)]
pub struct CoapConfig {
    pub mode: CoapMode,
    /// Local port for multicast mode.
    pub port: u16,
    pub multicast_group: Ipv4Addr,
    /// Interface used to join the group.
    pub interface: Ipv4Addr,
    /// Read deadline between stop-signal checks.
    pub read_timeout: Duration,
    pub max_datagram_size: usize,
}

impl CoapConfig {
    pub fn multicast() -> Self {
        Self {
            mode: CoapMode::Multicast,
            port: COIOT_PORT,
            multicast_group: COIOT_MULTICAST_GROUP,
            interface: Ipv4Addr::UNSPECIFIED,
            read_timeout: Duration::from_millis(500),
            max_datagram_size: 2048,
        }
    }

    pub fn unicast(device: SocketAddr) -> Self {
        Self {
            mode: CoapMode::Unicast { device },
            ..Self::multicast()
        }
    }

    #[must_use]
    pub fn port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    #[must_use]
    pub fn interface(mut self, interface: Ipv4Addr) -> Self {
        self.interface = interface;
        self
    }

    #[must_use]
    pub fn read_timeout(mut self, read_timeout: Duration) -> Self {
        self.read_timeout = read_timeout;
        self
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.read_timeout.is_zero() {
            return Err("Read timeout must be > 0".to_string());
        }
        if self.max_datagram_size < 4 {
            return Err("Max datagram size must hold a CoAP header".to_string());
        }
        if self.mode == CoapMode::Multicast && !self.multicast_group.is_multicast() {
            return Err(format!("{} is not a multicast address", self.multicast_group));
        }
        Ok(())
    }

    async fn open_socket(&self) -> TransportResult<UdpSocket> {
        match &self.mode {
            CoapMode::Unicast { device } => {
                let local: SocketAddr = if device.is_ipv4() {
                    (Ipv4Addr::UNSPECIFIED, 0).into()
                } else {
                    (std::net::Ipv6Addr::UNSPECIFIED, 0).into()
                };
                let socket = UdpSocket::bind(local).await?;
                socket.connect(*device).await?;
                Ok(socket)
            }
            CoapMode::Multicast => self.open_multicast_socket(),
        }
    }

    fn open_multicast_socket(&self) -> TransportResult<UdpSocket> {
        let socket = bind_shared(self.port)?;
        socket.join_multicast_v4(&self.multicast_group, &self.interface)?;
        Ok(UdpSocket::from_std(socket.into())?)
    }
}

/// Non-blocking UDP socket on `0.0.0.0:port` with address reuse, so several
/// listeners can share the CoIoT port.
fn bind_shared(port: u16) -> std::io::Result<Socket> {
    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(all(unix, not(any(target_os = "solaris", target_os = "illumos"))))]
    socket.set_reuse_port(true)?;
    socket.set_nonblocking(true)?;
    socket.bind(&SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port).into())?;
    Ok(socket)
}

impl Default for CoapConfig {
    fn default() -> Self {
        Self::multicast()
    }
}

/// Frame counters.
#[derive(Debug, Default)]
struct Counters {
    received: AtomicU64,
    dropped: AtomicU64,
}

/// Wrap a decoded frame as a status notification.
pub fn status_notification(message: CoapMessage, source: SocketAddr) -> Notification {
    let src = message.coiot_device_id().map(|device| device.id);
    Notification {
        method: COIOT_STATUS_METHOD.to_string(),
        params: Some(message.payload),
        src,
        source: Some(source),
    }
}

struct ListenerContext {
    socket: UdpSocket,
    read_timeout: Duration,
    max_datagram_size: usize,
    handler: Arc<HandlerSlot>,
    state: Arc<StateMachine>,
    stop: Arc<AtomicBool>,
    counters: Arc<Counters>,
}

impl ListenerContext {
    async fn run(self) {
        let mut buf = vec![0u8; self.max_datagram_size];

        while !self.stop.load(Ordering::Acquire) {
            let (len, source) = match timeout(self.read_timeout, self.socket.recv_from(&mut buf)).await
            {
                Err(_) => continue,
                Ok(Ok(received)) => received,
                Ok(Err(err)) => {
                    warn!(error = %err, "CoIoT socket read failed");
                    self.state.transition(ConnectionState::Disconnected);
                    return;
                }
            };

            self.counters.received.fetch_add(1, Ordering::Relaxed);
            match codec::decode(&buf[..len]) {
                Ok(message) => {
                    self.handler.dispatch(&status_notification(message, source));
                }
                Err(err) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    debug!(%source, error = %err, "dropping malformed CoAP frame");
                }
            }
        }
    }
}

struct Listener {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
    local_addr: SocketAddr,
}

/// Listens for CoIoT status broadcasts. Calls are not supported.
pub struct CoapTransport {
    config: CoapConfig,
    state: Arc<StateMachine>,
    handler: Arc<HandlerSlot>,
    listener: AsyncMutex<Option<Listener>>,
    counters: Arc<Counters>,
    closed: AtomicBool,
}

impl std::fmt::Debug for CoapTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoapTransport")
            .field("mode", &self.config.mode)
            .field("state", &self.state.get())
            .finish()
    }
}

impl CoapTransport {
    pub fn new(config: CoapConfig) -> TransportResult<Self> {
        config.validate().map_err(TransportError::config)?;
        Ok(Self {
            config,
            state: Arc::new(StateMachine::new()),
            handler: Arc::new(HandlerSlot::new()),
            listener: AsyncMutex::new(None),
            counters: Arc::new(Counters::default()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &CoapConfig {
        &self.config
    }

    /// Bound address of the listening socket, once connected.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.lock().await.as_ref().map(|l| l.local_addr)
    }

    /// Datagrams received and datagrams dropped as malformed.
    pub fn frame_counts(&self) -> (u64, u64) {
        (
            self.counters.received.load(Ordering::Relaxed),
            self.counters.dropped.load(Ordering::Relaxed),
        )
    }
}

#[async_trait]
impl Connectable for CoapTransport {
    async fn connect(&self) -> TransportResult<()> {
        let mut listener = self.listener.lock().await;
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        if listener.as_ref().is_some_and(|l| !l.handle.is_finished()) {
            return Ok(());
        }

        self.state.transition(ConnectionState::Connecting);
        let socket = match self.config.open_socket().await {
            Ok(socket) => socket,
            Err(err) => {
                self.state.transition(ConnectionState::Disconnected);
                return Err(err);
            }
        };
        let local_addr = socket.local_addr()?;

        let stop = Arc::new(AtomicBool::new(false));
        let context = ListenerContext {
            socket,
            read_timeout: self.config.read_timeout,
            max_datagram_size: self.config.max_datagram_size,
            handler: Arc::clone(&self.handler),
            state: Arc::clone(&self.state),
            stop: Arc::clone(&stop),
            counters: Arc::clone(&self.counters),
        };
        let handle = tokio::spawn(context.run());
        *listener = Some(Listener {
            stop,
            handle,
            local_addr,
        });

        self.state.transition(ConnectionState::Connected);
        info!(mode = ?self.config.mode, %local_addr, "CoIoT listener started");
        Ok(())
    }
}

#[async_trait]
impl Transport for CoapTransport {
    async fn call(&self, request: Request) -> TransportResult<Bytes> {
        Err(TransportError::unsupported(format!(
            "CoIoT is status-only; use an HTTP, WebSocket or MQTT transport to call {}",
            request.method
        )))
    }

    async fn close(&self) -> TransportResult<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(listener) = self.listener.lock().await.take() {
            listener.stop.store(true, Ordering::Release);
            let _ = listener.handle.await;
        }
        self.state.close();
        info!("CoIoT listener closed");
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
        let (received, dropped) = self.frame_counts();
        TransportMetrics {
            requests_successful: received.saturating_sub(dropped),
            requests_failed: dropped,
            ..TransportMetrics::default()
        }
    }
}

impl Subscriber for CoapTransport {
    fn subscribe(&self, handler: NotificationHandler) -> TransportResult<()> {
        self.handler.set(handler)
    }

    fn unsubscribe(&self) {
        self.handler.clear();
    }
}

impl Stateful for CoapTransport {
    fn state(&self) -> ConnectionState {
        self.state.get()
    }

    fn on_state_change(&self, callback: StateCallback) {
        self.state.on_change(callback);
    }
}

//! # IoT Transport
//!
//! Uniform request/response and notification transports for talking to
//! networked IoT devices.
//!
//! Every transport implements [`Transport`]: send a [`Request`], get back
//! the raw `result` bytes of the device's reply. Optional capabilities are
//! discovered at runtime:
//!
//! | Transport          | call | [`Subscriber`] | [`Stateful`] | [`Connectable`] |
//! |--------------------|------|----------------|--------------|-----------------|
//! | [`HttpTransport`]  | yes  |                |              |                 |
//! | [`WsTransport`]    | yes  | yes            | yes          | yes             |
//! | [`MqttTransport`]  | yes  | yes            | yes          | yes             |
//! | [`CoapTransport`]  |      | yes            | yes          | yes             |
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use iot_transport::{HttpConfig, HttpTransport, Request, Transport};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = HttpConfig::builder("http://192.168.1.20")
//!         .timeout(std::time::Duration::from_secs(5))
//!         .digest_auth("admin", "secret")
//!         .build()?;
//!
//!     let transport = HttpTransport::new(config)?;
//!     let info = transport.call(Request::new("Shelly.GetDeviceInfo")).await?;
//!     println!("{}", String::from_utf8_lossy(&info));
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod error;
pub mod pending;
pub mod reconnect;
pub mod router;
pub mod state;
pub mod subscription;
pub mod transport;

#[cfg(feature = "coap")]
pub mod coap;
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "mqtt")]
pub mod mqtt;
#[cfg(feature = "websocket")]
pub mod websocket;

pub use auth::{AuthScheme, Credentials};
#[cfg(feature = "coap")]
pub use coap::{CoapConfig, CoapTransport};
pub use error::{TransportError, TransportResult};
#[cfg(feature = "http")]
pub use http::{HttpConfig, HttpConfigBuilder, HttpTransport};
#[cfg(feature = "mqtt")]
pub use mqtt::{MqttConfig, MqttTransport};
pub use reconnect::BackoffConfig;
pub use router::NotificationRouter;
pub use state::{ConnectionState, StateCallback};
pub use transport::{
    Connectable, Notification, NotificationHandler, Request, Stateful, Subscriber, Transport,
    TransportMetrics,
};
#[cfg(feature = "websocket")]
pub use websocket::{WsConfig, WsTransport};

//! WebSocket transport with id correlation, keepalive and reconnect.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────┐  text frame   ┌──────────────┐
//! │ WsTransport │──────────────▶│    Device    │
//! │   call()    │               │   /rpc (ws)  │
//! └──────┬──────┘               └──────┬───────┘
//!        │ register id                 │ frames
//!        ▼                             ▼
//! ┌─────────────────┐  resolve  ┌──────────────┐   loss   ┌────────────┐
//! │ PendingRequests │◀──────────│ reader task  │─────────▶│ supervisor │
//! └─────────────────┘           └──────┬───────┘          │ (reconnect)│
//!                                      │ notify           └────────────┘
//!                                      ▼
//!                               ┌──────────────┐
//!                               │ HandlerSlot  │
//!                               └──────────────┘
//! ```
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use iot_transport::{
//!     transport::{Request, Transport},
//!     websocket::{WsConfig, WsTransport},
//! };
//!
//! # async fn run() -> Result<(), iot_transport::TransportError> {
//! let config = WsConfig::new("ws://192.168.1.20/rpc")
//!     .ping_interval(std::time::Duration::from_secs(20));
//! let transport = WsTransport::new(config)?;
//!
//! let status = transport.call(Request::new("Shelly.GetStatus")).await?;
//! println!("{}", String::from_utf8_lossy(&status));
//! transport.close().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod connection;

pub use config::WsConfig;
pub use connection::WsTransport;

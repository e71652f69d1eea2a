//! CoIoT Listener Example
//!
//! Joins the CoIoT multicast group and prints every status broadcast.
//!
//! Run with: `cargo run -p iot-transport --example coiot_listener`

use std::sync::Arc;

use iot_transport::{
    CoapConfig, CoapTransport, Connectable, Notification, NotificationRouter, Subscriber,
    Transport, TransportResult, coap::COIOT_STATUS_METHOD,
};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> TransportResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let transport = CoapTransport::new(CoapConfig::multicast())?;

    let router = Arc::new(NotificationRouter::new());
    router.on_method(
        COIOT_STATUS_METHOD,
        Arc::new(|n: &Notification| {
            let device = n.src.as_deref().unwrap_or("unknown");
            let from = n.source.map(|s| s.to_string()).unwrap_or_default();
            println!("{device} ({from}): {}", n.params_str());
        }),
    );
    transport.subscribe(router.into_handler())?;
    transport.connect().await?;

    println!("listening for CoIoT broadcasts, ctrl-c to stop");
    tokio::signal::ctrl_c().await?;

    let (received, dropped) = transport.frame_counts();
    println!("received {received} datagrams, dropped {dropped}");
    transport.close().await
}

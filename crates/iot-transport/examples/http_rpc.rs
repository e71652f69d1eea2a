//! HTTP RPC Example
//!
//! Calls a device over HTTP, answering a digest challenge when credentials
//! are supplied.
//!
//! Run with: `cargo run -p iot-transport --example http_rpc -- http://192.168.1.20 [user] [password]`

use std::time::Duration;

use iot_transport::{HttpConfig, HttpTransport, Request, Transport, TransportResult};
use serde_json::json;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> TransportResult<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let mut args = std::env::args().skip(1);
    let base_url = args.next().unwrap_or_else(|| "http://192.168.33.1".to_string());

    let mut builder = HttpConfig::builder(base_url)
        .timeout(Duration::from_secs(5))
        .retry(2, Duration::from_millis(200));
    if let (Some(user), Some(password)) = (args.next(), args.next()) {
        builder = builder.digest_auth(user, password);
    }
    let transport = HttpTransport::new(builder.build()?)?;

    let info = transport.call(Request::new("Shelly.GetDeviceInfo")).await?;
    println!("device info: {}", String::from_utf8_lossy(&info));

    let status = transport
        .call(Request::new("Switch.GetStatus").params(&json!({"id": 0}))?)
        .await?;
    println!("switch:0 = {}", String::from_utf8_lossy(&status));

    // Legacy REST path, returned verbatim.
    match transport.call(Request::new("/shelly")).await {
        Ok(body) => println!("/shelly: {}", String::from_utf8_lossy(&body)),
        Err(err) if err.is_not_found() => println!("/shelly not available"),
        Err(err) => return Err(err),
    }

    println!("{:?}", transport.metrics());
    transport.close().await
}

#![cfg(feature = "coap")]

use std::{net::SocketAddr, sync::Arc, time::Duration};

use iot_transport::{
    CoapConfig, CoapTransport, Connectable, Notification, NotificationRouter, Subscriber,
    Transport,
    coap::{COIOT_STATUS_METHOD, decode},
};
use tokio::{net::UdpSocket, sync::mpsc, time::timeout};

const DEVICE_ID: &[u8] = b"SHSW-25#C45BBE6B2D10#2";
const STATUS: &[u8] = br#"{"G":[[0,112,1],[1,112,0]]}"#;

/// Non-confirmable CoIoT status frame with a global device id option.
fn status_frame() -> Vec<u8> {
    // delta 3332 = 269 + 0x0BF7, length 22 = 13 + 9
    let mut frame = vec![0x50, 0x1E, 0x12, 0x34, 0xED, 0x0B, 0xF7, 0x09];
    frame.extend_from_slice(DEVICE_ID);
    frame.push(0xFF);
    frame.extend_from_slice(STATUS);
    frame
}

#[test]
fn frame_fixture_decodes() {
    let message = decode(&status_frame()).unwrap();
    assert_eq!(message.message_id, 0x1234);
    let device = message.coiot_device_id().unwrap();
    assert_eq!(device.device_type, "SHSW-25");
    assert_eq!(device.id, "C45BBE6B2D10");
    assert_eq!(message.payload_str().as_bytes(), STATUS);
}

#[tokio::test]
async fn router_fans_out_status_broadcasts() {
    let device = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let transport = CoapTransport::new(
        CoapConfig::unicast(device.local_addr().unwrap()).read_timeout(Duration::from_millis(50)),
    )
    .unwrap();

    let router = Arc::new(NotificationRouter::new());
    let (all_tx, mut all_rx) = mpsc::unbounded_channel::<String>();
    let (status_tx, mut status_rx) = mpsc::unbounded_channel::<Option<String>>();
    router.on_notification(Arc::new(move |n: &Notification| {
        let _ = all_tx.send(n.method.clone());
    }));
    router.on_method(
        COIOT_STATUS_METHOD,
        Arc::new(move |n: &Notification| {
            let _ = status_tx.send(n.src.clone());
        }),
    );
    router.on_method("NotifyEvent", Arc::new(|_: &Notification| panic!("wrong route")));

    transport.subscribe(Arc::clone(&router).into_handler()).unwrap();
    transport.connect().await.unwrap();

    let port = transport.local_addr().await.unwrap().port();
    let target: SocketAddr = ([127, 0, 0, 1], port).into();
    device.send_to(&status_frame(), target).await.unwrap();

    let method = timeout(Duration::from_secs(2), all_rx.recv()).await.unwrap();
    assert_eq!(method.as_deref(), Some(COIOT_STATUS_METHOD));
    let src = timeout(Duration::from_secs(2), status_rx.recv()).await.unwrap();
    assert_eq!(src, Some(Some("C45BBE6B2D10".to_string())));

    transport.close().await.unwrap();
}

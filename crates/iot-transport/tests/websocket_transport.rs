#![cfg(feature = "websocket")]

use std::{
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicUsize, Ordering},
    },
    time::Duration,
};

use futures_util::{SinkExt, StreamExt};
use iot_transport::{
    ConnectionState, Connectable, Notification, Request, Stateful, Subscriber, Transport,
    TransportError, WsConfig, WsTransport,
};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::{
    net::TcpListener,
    sync::mpsc,
    time::{sleep, timeout},
};
use tokio_tungstenite::{accept_async, tungstenite::Message};

/// What the fake device does with one inbound request.
enum Action {
    Reply(Vec<String>),
    Drop,
}

type Script = Arc<dyn Fn(usize, &Value) -> Action + Send + Sync>;

/// A running fake device.
struct Device {
    url: String,
    /// Completed TCP accepts, refused ones excluded.
    connections: Arc<AtomicUsize>,
    pings: Arc<AtomicUsize>,
    /// While set, new TCP connections are closed before the handshake.
    refuse: Arc<AtomicBool>,
}

/// Accepts WebSocket connections and answers each request per `script`,
/// which receives the zero-based connection index.
async fn start_device(script: Script) -> std::io::Result<Device> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let connections = Arc::new(AtomicUsize::new(0));
    let pings = Arc::new(AtomicUsize::new(0));
    let refuse = Arc::new(AtomicBool::new(false));

    let accepted = Arc::clone(&connections);
    let ping_count = Arc::clone(&pings);
    let refusing = Arc::clone(&refuse);
    tokio::spawn(async move {
        loop {
            let (stream, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            if refusing.load(Ordering::SeqCst) {
                drop(stream);
                continue;
            }

            let index = accepted.fetch_add(1, Ordering::SeqCst);
            let script = Arc::clone(&script);
            let ping_count = Arc::clone(&ping_count);
            tokio::spawn(async move {
                let Ok(mut ws) = accept_async(stream).await else {
                    return;
                };
                while let Some(Ok(message)) = ws.next().await {
                    let text = match message {
                        Message::Text(text) => text,
                        Message::Ping(_) => {
                            ping_count.fetch_add(1, Ordering::SeqCst);
                            continue;
                        }
                        _ => continue,
                    };
                    let Ok(request) = serde_json::from_str::<Value>(&text) else {
                        continue;
                    };
                    match script(index, &request) {
                        Action::Reply(frames) => {
                            for frame in frames {
                                if ws.send(Message::Text(frame)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Action::Drop => return,
                    }
                }
            });
        }
    });

    Ok(Device {
        url: format!("ws://{addr}/rpc"),
        connections,
        pings,
        refuse,
    })
}

fn echo(request: &Value) -> String {
    json!({
        "id": request["id"],
        "src": "shellyplus1-a8032ab12345",
        "dst": request["src"],
        "result": {"method": request["method"]},
    })
    .to_string()
}

fn test_config(url: String) -> WsConfig {
    WsConfig::new(url)
        .client_id("test-client")
        .request_timeout(Duration::from_secs(2))
        .reconnect_initial_delay(Duration::from_millis(20))
        .reconnect_max_delay(Duration::from_millis(100))
        .reconnect_jitter(0.0)
        .ping_interval(Duration::ZERO)
}

#[tokio::test]
async fn call_round_trip_carries_id_and_source() {
    let Device { url, .. } = start_device(Arc::new(|_: usize, request: &Value| {
        assert_eq!(request["src"], "test-client");
        assert_eq!(request["params"]["id"], 0);
        assert!(request["id"].as_u64().is_some_and(|id| id > 0));
        Action::Reply(vec![echo(request)])
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url)).unwrap();
    let result = transport
        .call(
            Request::new("Switch.GetStatus")
                .params(&json!({"id": 0}))
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(&result[..], br#"{"method":"Switch.GetStatus"}"#);
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(transport.pending_count(), 0);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn notifications_reach_the_handler() {
    let Device { url, .. } = start_device(Arc::new(|_: usize, request: &Value| {
        let notify = json!({
            "src": "shellyplus1-a8032ab12345",
            "method": "NotifyStatus",
            "params": {"switch:0": {"output": true}},
        })
        .to_string();
        Action::Reply(vec![notify, echo(request)])
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url)).unwrap();
    let (tx, mut rx) = mpsc::unbounded_channel();
    transport
        .subscribe(Arc::new(move |n: &Notification| {
            let _ = tx.send(n.clone());
        }))
        .unwrap();

    let second = transport.subscribe(Arc::new(|_: &Notification| {}));
    assert!(matches!(second, Err(TransportError::HandlerAlreadyRegistered)));

    transport.call(Request::new("Shelly.GetStatus")).await.unwrap();

    let notification = timeout(Duration::from_secs(2), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(notification.method, "NotifyStatus");
    assert_eq!(notification.src.as_deref(), Some("shellyplus1-a8032ab12345"));
    assert_eq!(
        notification.params_str(),
        r#"{"switch:0":{"output":true}}"#
    );

    transport.unsubscribe();
    transport
        .subscribe(Arc::new(|_: &Notification| {}))
        .unwrap();
    transport.close().await.unwrap();
}

#[tokio::test]
async fn reconnects_after_connection_loss() {
    let Device {
        url, connections, ..
    } = start_device(Arc::new(|index: usize, request: &Value| {
        if index == 0 {
            Action::Drop
        } else {
            Action::Reply(vec![echo(request)])
        }
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url)).unwrap();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&transitions);
    transport.on_state_change(Arc::new(move |old: ConnectionState, new: ConnectionState| {
        recorder.lock().push((old, new));
    }));

    transport.connect().await.unwrap();
    let err = transport
        .call(Request::new("Switch.Toggle"))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::ConnectionLost { .. }),
        "{err}"
    );

    for _ in 0..100 {
        if connections.load(Ordering::SeqCst) >= 2 && transport.state().is_connected() {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(transport.state(), ConnectionState::Connected);

    let result = transport.call(Request::new("Switch.Toggle")).await.unwrap();
    assert_eq!(&result[..], br#"{"method":"Switch.Toggle"}"#);

    let seen = transitions.lock().clone();
    assert!(seen.contains(&(ConnectionState::Connected, ConnectionState::Disconnected)));
    assert!(seen.contains(&(ConnectionState::Disconnected, ConnectionState::Reconnecting)));
    assert!(seen.contains(&(ConnectionState::Reconnecting, ConnectionState::Connected)));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn close_is_terminal_and_idempotent() {
    let Device { url, .. } = start_device(Arc::new(|_: usize, request: &Value| {
        Action::Reply(vec![echo(request)])
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url)).unwrap();
    transport.connect().await.unwrap();

    transport.close().await.unwrap();
    transport.close().await.unwrap();
    assert_eq!(transport.state(), ConnectionState::Closed);

    let err = transport.call(Request::new("Sys.GetStatus")).await.unwrap_err();
    assert!(err.is_closed());
    assert!(matches!(transport.connect().await, Err(TransportError::Closed)));
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let Device { url, .. } = start_device(Arc::new(|_: usize, _: &Value| Action::Reply(Vec::new())))
        .await
        .unwrap();

    let transport = WsTransport::new(
        test_config(url).request_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let err = transport.call(Request::new("Sys.GetStatus")).await.unwrap_err();
    assert!(err.is_timeout(), "{err}");
    assert_eq!(transport.pending_count(), 0);

    let err = transport
        .call(Request::new("Sys.GetStatus").timeout(Duration::from_millis(50)))
        .await
        .unwrap_err();
    assert!(
        matches!(err, TransportError::DeadlineExceeded { .. }),
        "{err}"
    );

    transport.close().await.unwrap();
}

#[tokio::test]
async fn zero_request_id_is_replaced() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&seen);
    let Device { url, .. } = start_device(Arc::new(move |_: usize, request: &Value| {
        recorder.lock().push(request["id"].as_u64());
        Action::Reply(vec![echo(request)])
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url)).unwrap();
    let result = timeout(
        Duration::from_secs(1),
        transport.call(Request::new("Sys.GetStatus").id(0)),
    )
    .await
    .expect("id 0 call never resolved")
    .unwrap();
    assert_eq!(&result[..], br#"{"method":"Sys.GetStatus"}"#);

    transport
        .call(Request::new("Sys.GetConfig").id(5))
        .await
        .unwrap();

    let seen = seen.lock().clone();
    assert_eq!(seen.len(), 2);
    assert!(seen[0].is_some_and(|id| id != 0), "{seen:?}");
    assert_eq!(seen[1], Some(5));

    transport.close().await.unwrap();
}

#[tokio::test]
async fn keepalive_sends_pings() {
    let Device { url, pings, .. } = start_device(Arc::new(|_: usize, request: &Value| {
        Action::Reply(vec![echo(request)])
    }))
    .await
    .unwrap();

    let transport =
        WsTransport::new(test_config(url).ping_interval(Duration::from_millis(50))).unwrap();
    transport.connect().await.unwrap();

    for _ in 0..100 {
        if pings.load(Ordering::SeqCst) >= 2 {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert!(pings.load(Ordering::SeqCst) >= 2);
    assert_eq!(transport.state(), ConnectionState::Connected);

    transport.close().await.unwrap();
}

#[tokio::test]
async fn gives_up_reconnecting_then_reconnects_on_next_call() {
    let Device {
        url,
        connections,
        refuse,
        ..
    } = start_device(Arc::new(|index: usize, request: &Value| {
        if index == 0 {
            Action::Drop
        } else {
            Action::Reply(vec![echo(request)])
        }
    }))
    .await
    .unwrap();

    let transport = WsTransport::new(test_config(url).reconnect_max_attempts(2)).unwrap();
    let transitions = Arc::new(Mutex::new(Vec::new()));
    let recorder = Arc::clone(&transitions);
    transport.on_state_change(Arc::new(move |old: ConnectionState, new: ConnectionState| {
        recorder.lock().push((old, new));
    }));

    transport.connect().await.unwrap();
    refuse.store(true, Ordering::SeqCst);
    let err = transport
        .call(Request::new("Switch.Toggle"))
        .await
        .unwrap_err();
    assert!(matches!(err, TransportError::ConnectionLost { .. }), "{err}");

    for _ in 0..100 {
        if transitions
            .lock()
            .contains(&(ConnectionState::Reconnecting, ConnectionState::Disconnected))
        {
            break;
        }
        sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(transport.state(), ConnectionState::Disconnected);
    assert_eq!(connections.load(Ordering::SeqCst), 1);

    refuse.store(false, Ordering::SeqCst);
    let result = transport.call(Request::new("Switch.Toggle")).await.unwrap();
    assert_eq!(&result[..], br#"{"method":"Switch.Toggle"}"#);
    assert_eq!(transport.state(), ConnectionState::Connected);
    assert_eq!(connections.load(Ordering::SeqCst), 2);

    transport.close().await.unwrap();
}

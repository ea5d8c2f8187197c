//! Integration tests for the transport layer
//!
//! These tests drive a transport over scripted in-memory sockets.

mod common;

use common::*;
use parking_lot::Mutex;
use rand::Rng;
use socketmux::*;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

fn transport(connector: Arc<ScriptedConnector>) -> Arc<Transport> {
    Transport::new(
        7,
        "wss://scripted",
        Arc::new(SocketConfig::new().startup_timeout(Duration::from_secs(1))),
        connector,
    )
}

fn collect_messages(transport: &Transport) -> Arc<Mutex<Vec<String>>> {
    let messages = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&messages);
    transport.observers().add(move |event| {
        if let TransportEvent::Message(text) = event {
            sink.lock().push(text.clone());
        }
    });
    messages
}

#[tokio::test]
async fn test_sends_are_written_in_fifo_order() {
    verbose_println!("Testing FIFO send order...");

    let connector = ScriptedConnector::new();
    let transport = transport(Arc::clone(&connector));
    transport.connect().await.unwrap();

    let sent: Vec<String> = (0..500).map(|i| format!("message-{}", i)).collect();
    for message in &sent {
        transport.send(WsMessage::Text(message.clone())).unwrap();
    }

    let socket = connector.latest().unwrap();
    assert!(wait_until(Duration::from_secs(2), || socket.writes().len() == sent.len()).await);

    let written: Vec<String> = socket
        .writes()
        .iter()
        .filter_map(|m| m.as_text().map(str::to_string))
        .collect();
    assert_eq!(written, sent);
    assert_eq!(transport.metrics().messages_sent(), 500);
    verbose_println!("  {} messages written in order", written.len());
}

#[tokio::test]
async fn test_random_fragmentation_delivers_each_message_once() {
    verbose_println!("Testing reassembly of randomly fragmented messages...");

    let connector = ScriptedConnector::new();
    let transport = transport(Arc::clone(&connector));
    let messages = collect_messages(&transport);
    transport.connect().await.unwrap();
    let socket = connector.latest().unwrap();

    let mut rng = rand::thread_rng();
    let mut expected = Vec::new();
    for i in 0..50 {
        let payload = format!(
            r#"{{"seq":{},"book":"{}"}}"#,
            i,
            "x".repeat(rng.gen_range(1..300))
        );
        let cut_count = rng.gen_range(0..8);
        let cuts: Vec<usize> = (0..cut_count)
            .map(|_| rng.gen_range(0..payload.len()))
            .collect();

        for (index, frame) in fragment(payload.as_bytes(), true, &cuts).into_iter().enumerate() {
            socket.push(frame);
            if index == 0 {
                // Control frames may arrive between fragments
                socket.push(Frame::Ping(vec![1]));
            }
        }
        expected.push(payload);
    }

    assert!(wait_until(Duration::from_secs(2), || messages.lock().len() == expected.len()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*messages.lock(), expected);
}

#[tokio::test]
async fn test_binary_messages_pass_through_interpreter() {
    let connector = ScriptedConnector::new();
    let transport = Transport::with_interpreters(
        1,
        "wss://scripted",
        Arc::new(SocketConfig::new()),
        Arc::clone(&connector) as Arc<dyn SocketConnector>,
        Arc::new(|bytes: &[u8]| -> Result<String> { Ok(format!("{} bytes", bytes.len())) }),
        Arc::new(TextFn(|text: String| -> Result<String> { Ok(text.to_uppercase()) })),
    );
    let messages = collect_messages(&transport);
    transport.connect().await.unwrap();
    let socket = connector.latest().unwrap();

    for frame in fragment(&[0u8; 64], false, &[10, 20]) {
        socket.push(frame);
    }
    socket.push_text("abc");

    assert!(wait_until(Duration::from_secs(1), || messages.lock().len() == 2).await);
    assert_eq!(*messages.lock(), vec!["64 bytes".to_string(), "ABC".to_string()]);
}

#[tokio::test]
async fn test_close_event_fires_once_under_concurrent_failures() {
    verbose_println!("Testing single close event...");

    let connector = ScriptedConnector::new();
    let transport = transport(Arc::clone(&connector));
    let closed = Arc::new(AtomicU32::new(0));
    let closed_clone = Arc::clone(&closed);
    transport.observers().add(move |event| {
        if matches!(event, TransportEvent::Closed { .. }) {
            closed_clone.fetch_add(1, Ordering::SeqCst);
        }
    });

    transport.connect().await.unwrap();
    let socket = connector.latest().unwrap();

    // Receive side fails while the client closes
    socket.fail("reset by peer");
    transport.close().await;
    socket.disconnect();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(closed.load(Ordering::SeqCst), 1);
    assert_eq!(transport.state(), TransportState::Closed);
    assert!(transport.send(WsMessage::Text("late".into())).is_err());
}

#[tokio::test]
async fn test_reset_keeps_identity_and_opens_new_socket() {
    let connector = ScriptedConnector::new();
    let transport = transport(Arc::clone(&connector));
    let messages = collect_messages(&transport);

    transport.connect().await.unwrap();
    connector.latest().unwrap().disconnect();
    assert!(wait_until(Duration::from_secs(1), || !transport.is_open()).await);

    // Closed until reset
    assert!(transport.connect().await.is_err());

    transport.reset();
    transport.connect().await.unwrap();
    assert_eq!(transport.id(), 7);
    assert_eq!(connector.socket_count(), 2);

    // The old socket can no longer deliver anything
    connector.socket(0).unwrap().push_text("stale");
    connector.socket(1).unwrap().push_text("fresh");
    assert!(wait_until(Duration::from_secs(1), || !messages.lock().is_empty()).await);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(*messages.lock(), vec!["fresh".to_string()]);
}

#[tokio::test]
async fn test_no_data_watchdog_closes_transport() {
    let connector = ScriptedConnector::new();
    let transport = Transport::new(
        1,
        "wss://scripted",
        Arc::new(SocketConfig::new().no_data_timeout(Some(Duration::from_millis(50)))),
        Arc::clone(&connector) as Arc<dyn SocketConnector>,
    );
    transport.connect().await.unwrap();
    assert!(transport.is_open());

    assert!(wait_until(Duration::from_secs(1), || !transport.is_open()).await);
    assert!(transport.last_activity().is_some());
}

#[tokio::test]
async fn test_refused_connect_is_reported() {
    let connector = ScriptedConnector::new();
    connector.refuse_connections(true);
    let transport = transport(Arc::clone(&connector));

    let result = transport.connect().await;
    assert!(matches!(result, Err(SocketError::ConnectFailed(_))));
    assert!(result.unwrap_err().is_transport());
    assert_eq!(transport.state(), TransportState::Closed);
}

//! Raw-frame tests against a running relay.

use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use scribe_collab::protocol::{Frame, WireMessage};
use scribe_relay::{RelayConfig, RelayServer};
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite;

async fn start_test_relay() -> (String, Arc<RelayServer>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let relay = Arc::new(RelayServer::new(RelayConfig {
        bind_addr: format!("127.0.0.1:{port}"),
        topic_capacity: 64,
        outgoing_capacity: 64,
    }));
    let server = relay.clone();
    tokio::spawn(async move {
        server.serve(listener).await.unwrap();
    });
    (format!("ws://127.0.0.1:{port}"), relay)
}

async fn settle() {
    sleep(Duration::from_millis(100)).await;
}

async fn next_frame<S>(ws: &mut S) -> Frame
where
    S: futures_util::Stream<Item = std::result::Result<tungstenite::Message, tungstenite::Error>> + Unpin,
{
    loop {
        let msg = timeout(Duration::from_secs(2), ws.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("valid message");
        if let tungstenite::Message::Binary(data) = msg {
            return Frame::decode(&data).unwrap();
        }
    }
}

fn binary(frame: &Frame) -> tungstenite::Message {
    tungstenite::Message::Binary(frame.encode().unwrap().into())
}

#[tokio::test]
async fn test_relay_accepts_connections() {
    let (url, _relay) = start_test_relay().await;
    let result = tokio_tungstenite::connect_async(&url).await;
    assert!(result.is_ok(), "Should connect to relay");
}

#[tokio::test]
async fn test_raw_subscribe_produce_deliver() {
    let (url, relay) = start_test_relay().await;
    let (mut consumer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();
    let (mut producer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    consumer
        .send(binary(&Frame::Subscribe {
            topic: "user-inputs".into(),
        }))
        .await
        .unwrap();
    settle().await;

    let wire = WireMessage {
        topic: "user-inputs".into(),
        payload: br#"{"input":"hi"}"#.to_vec(),
        timestamp: 7,
    };
    producer.send(binary(&Frame::Produce(wire.clone()))).await.unwrap();

    assert_eq!(next_frame(&mut consumer).await, Frame::Deliver(wire));

    let stats = relay.stats().await;
    assert_eq!(stats.total_connections, 2);
    assert_eq!(stats.messages_relayed, 1);
    assert_eq!(stats.active_topics, 1);
}

#[tokio::test]
async fn test_ping_pong() {
    let (url, _relay) = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(binary(&Frame::Ping)).await.unwrap();
    assert_eq!(next_frame(&mut ws).await, Frame::Pong);
}

#[tokio::test]
async fn test_garbage_frame_keeps_connection() {
    let (url, _relay) = start_test_relay().await;
    let (mut ws, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    ws.send(tungstenite::Message::Binary(vec![0xFF, 0xFF, 0xFF].into()))
        .await
        .unwrap();
    ws.send(binary(&Frame::Ping)).await.unwrap();
    assert_eq!(next_frame(&mut ws).await, Frame::Pong);
}

#[tokio::test]
async fn test_produce_without_consumers_creates_no_topic() {
    let (url, relay) = start_test_relay().await;
    let (mut producer, _) = tokio_tungstenite::connect_async(&url).await.unwrap();

    let wire = WireMessage {
        topic: "ai-outputs".into(),
        payload: br#"{"text":"nobody listens"}"#.to_vec(),
        timestamp: 1,
    };
    producer.send(binary(&Frame::Produce(wire))).await.unwrap();
    settle().await;

    let stats = relay.stats().await;
    assert_eq!(stats.messages_relayed, 1);
    assert_eq!(stats.active_topics, 0);
}

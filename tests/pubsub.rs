//! End-to-end publish/subscribe scenarios over the live wire protocol.

mod common;

use common::{base_config, start_broker, TestClient, SILENCE_WINDOW};
use std::time::{Duration, Instant};

#[tokio::test]
async fn info_greeting_describes_the_broker() {
    let broker = start_broker(base_config()).await;
    let (mut client, info) = TestClient::connect(broker.addr).await;

    assert_eq!(info["auth_required"], false);
    assert_eq!(info["ssl_required"], false);
    assert_eq!(info["max_payload"], 1024 * 1024);
    assert_eq!(info["port"], u64::from(broker.addr.port()));
    assert!(info["server_id"].as_str().is_some_and(|id| !id.is_empty()));

    // INFO can be requested again at any time.
    client.send("INFO\r\n").await;
    let line = client.read_line().await.unwrap();
    assert!(line.starts_with("INFO {"));
}

#[tokio::test]
async fn ping_pong() {
    let broker = start_broker(base_config()).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;

    // Verbs are case-insensitive.
    client.send("ping\r\n").await;
    client.expect_line("PONG").await;
}

#[tokio::test]
async fn basic_pubsub() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo", 1).await;
    publisher.publish("foo", "hello").await;

    subscriber.expect_msg("MSG foo 1 5", "hello").await;
}

#[tokio::test]
async fn wildcard_subscription_matches() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo.*", 1).await;
    subscriber.subscribe("orders.>", 2).await;

    publisher.publish("foo.bar", "hey").await;
    subscriber.expect_msg("MSG foo.bar 1 3", "hey").await;

    publisher.publish("orders.new.us", "o").await;
    subscriber.expect_msg("MSG orders.new.us 2 1", "o").await;

    // One token only for `*`.
    publisher.publish("foo.bar.baz", "x").await;
    assert_eq!(subscriber.try_read_line(SILENCE_WINDOW).await, None);
}

#[tokio::test]
async fn reply_to_rides_the_msg_header() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("req", 4).await;
    publisher.send("PUB req inbox.77 2\r\nhi\r\n").await;
    publisher.expect_ok().await;

    subscriber.expect_msg("MSG req 4 inbox.77 2", "hi").await;
}

#[tokio::test]
async fn queue_group_delivers_each_message_once() {
    let broker = start_broker(base_config()).await;
    let (mut first, _) = TestClient::connect(broker.addr).await;
    let (mut second, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    first.send("SUB work q1 1\r\n").await;
    first.expect_ok().await;
    second.send("SUB work q1 1\r\n").await;
    second.expect_ok().await;

    const ROUNDS: usize = 3;
    for _ in 0..ROUNDS {
        publisher.publish("work", "X").await;
    }

    // Exactly one member receives each message; which one is random.
    let mut delivered = 0;
    let deadline = Instant::now() + Duration::from_secs(3);
    while delivered < ROUNDS && Instant::now() < deadline {
        for client in [&mut first, &mut second] {
            while let Some(line) = client.try_read_line(Duration::from_millis(100)).await {
                if line.starts_with("MSG work 1 1") {
                    client.expect_line("X").await;
                    delivered += 1;
                }
            }
        }
    }
    assert_eq!(delivered, ROUNDS);

    // And no duplicates straggle in.
    assert_eq!(first.try_read_line(SILENCE_WINDOW).await, None);
    assert_eq!(second.try_read_line(SILENCE_WINDOW).await, None);
}

#[tokio::test]
async fn auto_unsubscribe_after_max_responses() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo", 7).await;
    subscriber.send("UNSUB 7 2\r\n").await;
    subscriber.expect_ok().await;

    publisher.publish("foo", "a").await;
    publisher.publish("foo", "b").await;
    publisher.publish("foo", "c").await;

    subscriber.expect_msg("MSG foo 7 1", "a").await;
    subscriber.expect_msg("MSG foo 7 1", "b").await;
    // The threshold was two; the third publish is not delivered.
    assert_eq!(subscriber.try_read_line(SILENCE_WINDOW).await, None);

    // The sid is fully forgotten after the last delivery.
    subscriber.send("UNSUB 7\r\n").await;
    subscriber
        .expect_line("-ERR 'Invalid Subject-Identifier (sid), no subscriber registered'")
        .await;
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo", 1).await;
    subscriber.send("UNSUB 1\r\n").await;
    subscriber.expect_ok().await;

    publisher.publish("foo", "gone").await;
    assert_eq!(subscriber.try_read_line(SILENCE_WINDOW).await, None);
}

#[tokio::test]
async fn duplicate_sid_is_rejected_without_breaking_the_original() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo", 1).await;
    subscriber.send("SUB bar 1\r\n").await;
    subscriber
        .expect_line("-ERR 'Invalid Subject Identifier (sid), already taken'")
        .await;

    publisher.publish("foo", "ok").await;
    subscriber.expect_msg("MSG foo 1 2", "ok").await;

    // The rejected subject never took effect.
    publisher.publish("bar", "no").await;
    assert_eq!(subscriber.try_read_line(SILENCE_WINDOW).await, None);
}

#[tokio::test]
async fn invalid_subjects_are_rejected_but_not_fatal() {
    let broker = start_broker(base_config()).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    client.send("SUB foo..bar 1\r\n").await;
    client.expect_line("-ERR 'Invalid Subject'").await;

    // Pedantic publishing rejects wildcard tokens.
    client.send("PUB foo.* 2\r\nhi\r\n").await;
    client.expect_line("-ERR 'Invalid Subject'").await;

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;
}

#[tokio::test]
async fn unknown_and_malformed_operations_are_not_fatal() {
    let broker = start_broker(base_config()).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    client.send("BOGUS args\r\n").await;
    client.expect_line("-ERR 'Unknown Protocol Operation'").await;

    client.send("SUB foo\r\n").await;
    client.expect_line("-ERR 'Unknown Protocol Operation'").await;

    client.send("CONNECT not-json\r\n").await;
    client
        .expect_line("-ERR 'Invalid config, valid JSON required for connection configuration'")
        .await;

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;
}

#[tokio::test]
async fn verbose_off_suppresses_acks() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.send("CONNECT {\"verbose\":false}\r\n").await;
    subscriber.send("SUB foo 1\r\n").await;

    publisher.send("CONNECT {\"verbose\":false}\r\n").await;
    // Sync both connections: PING is answered regardless of verbose.
    subscriber.send("PING\r\n").await;
    subscriber.expect_line("PONG").await;
    publisher.send("PING\r\n").await;
    publisher.expect_line("PONG").await;

    publisher.send("PUB foo 5\r\nhello\r\n").await;
    publisher.send("PING\r\n").await;
    publisher.expect_line("PONG").await;

    subscriber.expect_msg("MSG foo 1 5", "hello").await;
}

#[tokio::test]
async fn pedantic_off_skips_unsub_errors() {
    let broker = start_broker(base_config()).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    client.send("CONNECT {\"pedantic\":false}\r\n").await;
    client.expect_ok().await;

    client.send("UNSUB 99\r\n").await;
    assert_eq!(client.try_read_line(SILENCE_WINDOW).await, None);

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;
}

#[tokio::test]
async fn stats_track_the_message_flow() {
    let broker = start_broker(base_config()).await;
    let (mut subscriber, _) = TestClient::connect(broker.addr).await;
    let (mut publisher, _) = TestClient::connect(broker.addr).await;

    subscriber.subscribe("foo", 1).await;
    publisher.publish("foo", "hello").await;
    subscriber.expect_msg("MSG foo 1 5", "hello").await;

    let snapshot = broker.stats.snapshot();
    assert_eq!(snapshot.msg_recv, 1);
    assert_eq!(snapshot.bytes_recv, 5);
    assert_eq!(snapshot.msg_sent, 1);
    assert_eq!(snapshot.bytes_sent, 5);
    assert_eq!(snapshot.ops["SUB"], 1);
    assert_eq!(snapshot.ops["PUB"], 1);
}

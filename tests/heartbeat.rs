//! Server-initiated heartbeats over a live connection.

mod common;

use common::{base_config, start_broker, TestClient};
use std::time::Duration;

fn heartbeat_config(interval: Duration, max_outstanding: u32) -> nimbus::config::Config {
    let mut config = base_config();
    config.ping.interval = interval;
    config.ping.max_outstanding = max_outstanding;
    config
}

#[tokio::test]
async fn silent_client_is_dropped_after_the_budget() {
    let broker = start_broker(heartbeat_config(Duration::from_millis(100), 1)).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    // First fire sends a PING; the unanswered second fire is one past the
    // budget and drops the client.
    client.expect_line("PING").await;
    client
        .expect_line("-ERR 'Unresponsive client detected, connection dropped'")
        .await;
    client.expect_eof().await;

    assert_eq!(broker.stats.snapshot().unresponsive, 1);
}

#[tokio::test]
async fn ponging_keeps_the_connection_alive() {
    let broker = start_broker(heartbeat_config(Duration::from_millis(100), 1)).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    for _ in 0..4 {
        client.expect_line("PING").await;
        client.send("PONG\r\n").await;
    }

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;
}

#[tokio::test]
async fn client_pings_do_not_count_against_the_budget() {
    let broker = start_broker(heartbeat_config(Duration::from_millis(100), 2)).await;
    let (mut client, _) = TestClient::connect(broker.addr).await;

    client.send("PING\r\n").await;
    client.expect_line("PONG").await;

    client.expect_line("PING").await;
    client.send("PONG\r\n").await;
    client.expect_line("PING").await;
    client.send("PONG\r\n").await;
}

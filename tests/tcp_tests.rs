use mqbench::transport::tcp::TcpConnector;
use mqbench::{FixedBackoff, LinkEstablisher, Receiver, Relay, RunConfig, Sender};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

fn loopback() -> SocketAddr {
    "127.0.0.1:0".parse().unwrap()
}

fn fast_link(role: &str) -> LinkEstablisher {
    LinkEstablisher::new(role).with_backoff(FixedBackoff::new(Duration::from_millis(20)))
}

async fn bound() -> TcpConnector {
    TcpConnector::bind(loopback())
        .await
        .unwrap()
        .with_backoff(Arc::new(FixedBackoff::new(Duration::from_millis(20))))
}

/// Sender and receiver talking directly over loopback sockets.
#[tokio::test]
async fn test_direct_run_over_tcp() {
    let sender_conn = bound().await;
    let receiver_conn = bound().await;
    let sender_addr = sender_conn.local_addr();
    let receiver_addr = receiver_conn.local_addr();

    let mut receiver = Receiver::new(receiver_conn.with_peer(sender_addr.to_string()))
        .with_link(fast_link("RECEIVER"));
    let stop_receiver = receiver.cancellation_token().clone();
    let receiver_task = tokio::spawn(async move {
        let _ = receiver.run().await;
        receiver.runs_completed()
    });

    let config = RunConfig::uniform(256).with_message_count(200).with_seed(1);
    let mut sender = Sender::new(config, sender_conn.with_peer(receiver_addr.to_string()))
        .unwrap()
        .with_link(fast_link("SENDER"))
        .with_settle_delay(Duration::from_millis(300));

    let outcome = timeout(Duration::from_secs(20), sender.run())
        .await
        .expect("run should finish")
        .unwrap();

    assert_eq!(outcome.sent.message_counter, 200);
    assert_eq!(outcome.received.message_counter, 200);
    assert_eq!(outcome.loss_percent, 0.0);
    assert!(!outcome.received.timed_out);

    stop_receiver.cancel();
    assert_eq!(receiver_task.await.unwrap(), 1);
}

/// Full sender → broker → receiver path, with the receiver starting last.
#[tokio::test]
async fn test_run_through_tcp_broker() {
    let sender_conn = bound().await;
    let broker_up = bound().await;
    let broker_down = bound().await;
    let receiver_conn = bound().await;

    let sender_addr = sender_conn.local_addr().to_string();
    let broker_up_addr = broker_up.local_addr().to_string();
    let broker_down_addr = broker_down.local_addr().to_string();
    let receiver_addr = receiver_conn.local_addr().to_string();

    let mut relay = Relay::new(
        broker_up.with_peer(sender_addr),
        broker_down.with_peer(receiver_addr),
    )
    .with_links(fast_link("BROKER/upstream"), fast_link("BROKER/downstream"));
    let stop_relay = relay.cancellation_token().clone();
    let relay_task = tokio::spawn(async move {
        let _ = relay.run().await;
        relay.stats()
    });

    let config = RunConfig::uniform(100).with_message_count(100);
    let mut sender = Sender::new(config, sender_conn.with_peer(broker_up_addr))
        .unwrap()
        .with_link(fast_link("SENDER"))
        .with_settle_delay(Duration::from_millis(500));
    let sender_task = tokio::spawn(async move { sender.run().await });

    // The broker's downstream subscriber waits in the receiver's accept queue
    // until the receiver starts serving.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut receiver = Receiver::new(receiver_conn.with_peer(broker_down_addr))
        .with_link(fast_link("RECEIVER"));
    let stop_receiver = receiver.cancellation_token().clone();
    let receiver_task = tokio::spawn(async move {
        let _ = receiver.run().await;
        receiver.runs_completed()
    });

    let outcome = timeout(Duration::from_secs(20), sender_task)
        .await
        .expect("run should finish")
        .unwrap()
        .unwrap();
    assert_eq!(outcome.sent.message_counter, 100);
    assert_eq!(outcome.received.message_counter, 100);

    stop_receiver.cancel();
    stop_relay.cancel();
    assert_eq!(receiver_task.await.unwrap(), 1);
    let stats = relay_task.await.unwrap();
    assert!(stats.downstream_packets >= 101);
}

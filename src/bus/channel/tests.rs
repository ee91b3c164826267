use super::*;
use crate::bus::{Address, BusMessage};
use crate::error::HandlerError;
use crate::routing::Role;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

#[derive(Debug, Serialize, Deserialize)]
struct Ping;

impl BusMessage for Ping {
    const MESSAGE_TYPE: &'static str = "test.Ping";
}

struct CountingHandler {
    count: Arc<AtomicUsize>,
}

impl CountingHandler {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        (
            Self {
                count: count.clone(),
            },
            count,
        )
    }
}

impl MessageHandler for CountingHandler {
    fn handle(
        &self,
        _envelope: Arc<Envelope>,
    ) -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let count = self.count.clone();
        Box::pin(async move {
            count.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

fn ping(destination: Address) -> Envelope {
    Envelope::new(&Ping, destination).unwrap()
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test]
async fn test_channel_publish_no_receivers() {
    let bus = ChannelMessageBus::new();
    // Should not error even with no receivers
    assert!(bus.publish(ping(Address::controller())).await.is_ok());
}

#[tokio::test]
async fn test_channel_subscribe_and_receive() {
    let bus = ChannelMessageBus::new();
    let (handler, count) = CountingHandler::new();
    bus.subscribe(Subscription::role(Role::Controller), Arc::new(handler))
        .await
        .unwrap();

    bus.publish(ping(Address::controller())).await.unwrap();
    settle().await;

    assert_eq!(count.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_channel_delivers_only_to_matching_agent() {
    let bus = ChannelMessageBus::new();
    let (host1, host1_count) = CountingHandler::new();
    let (host2, host2_count) = CountingHandler::new();
    bus.subscribe(Subscription::agent(Role::VmHostAgent, "host-1"), Arc::new(host1))
        .await
        .unwrap();
    bus.subscribe(Subscription::agent(Role::VmHostAgent, "host-2"), Arc::new(host2))
        .await
        .unwrap();

    bus.publish(ping(Address::agent(Role::VmHostAgent, "host-1")))
        .await
        .unwrap();
    settle().await;

    assert_eq!(host1_count.load(Ordering::SeqCst), 1);
    assert_eq!(host2_count.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn test_channel_fans_out_to_every_matching_subscriber() {
    let bus = ChannelMessageBus::new();
    let (a, a_count) = CountingHandler::new();
    let (b, b_count) = CountingHandler::new();
    let (other, other_count) = CountingHandler::new();
    bus.subscribe(Subscription::role(Role::Controller), Arc::new(a))
        .await
        .unwrap();
    bus.subscribe(Subscription::role(Role::Controller), Arc::new(b))
        .await
        .unwrap();
    bus.subscribe(Subscription::role(Role::NetworkAgent), Arc::new(other))
        .await
        .unwrap();

    for _ in 0..3 {
        bus.publish(ping(Address::controller())).await.unwrap();
    }
    settle().await;

    assert_eq!(a_count.load(Ordering::SeqCst), 3);
    assert_eq!(b_count.load(Ordering::SeqCst), 3);
    assert_eq!(other_count.load(Ordering::SeqCst), 0);
    assert_eq!(bus.subscriber_count().await, 3);
}

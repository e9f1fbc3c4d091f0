//! End-to-end behaviour of small meshes running in one runtime.

use std::sync::Arc;
use std::time::{Duration, Instant};

use offline_mesh::link::{MemoryNetwork, TcpTransport};
use offline_mesh::{
    Identity, LinkAddress, LinkStatus, MeshConfig, MeshError, MeshEvent, MeshNode, MeshSnapshot,
    MemoryIdentityStore, ReceivedMessage,
};
use tokio::sync::mpsc::UnboundedReceiver;

const WAIT: Duration = Duration::from_secs(5);

type Events = UnboundedReceiver<MeshEvent>;

async fn memory_node(network: &MemoryNetwork, address: &str, identity: &str) -> (MeshNode, Events) {
    let (node, events) = MeshNode::start(
        &MeshConfig::default(),
        Arc::new(network.endpoint(address)),
        Arc::new(MemoryIdentityStore::with_identity(identity)),
    )
    .unwrap();
    node.listen().await.unwrap();
    (node, events)
}

async fn wait_until(node: &MeshNode, what: &str, check: impl Fn(&MeshSnapshot) -> bool) -> MeshSnapshot {
    let deadline = Instant::now() + WAIT;
    loop {
        let snapshot = node.snapshot().await.unwrap();
        if check(&snapshot) {
            return snapshot;
        }
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

async fn next_message(events: &mut Events) -> ReceivedMessage {
    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, events.recv())
            .await
            .expect("timed out waiting for a message")
            .expect("event channel closed");
        if let MeshEvent::Message(message) = event {
            return message;
        }
    }
}

fn id(s: &str) -> Identity {
    Identity::from(s)
}

fn addr(s: &str) -> LinkAddress {
    LinkAddress::from(s)
}

/// A - B - C in a line; A and C are out of each other's range.
async fn line_of_three(network: &MemoryNetwork) -> [(MeshNode, Events); 3] {
    let a = memory_node(network, "A", "devA").await;
    let b = memory_node(network, "B", "devB").await;
    let c = memory_node(network, "C", "devC").await;

    a.0.dial(&addr("B")).await.unwrap();
    b.0.dial(&addr("C")).await.unwrap();

    wait_until(&a.0, "A to learn devC behind B", |s| {
        s.identities.get(&id("devC")) == Some(&addr("C")) && s.routes.get(&addr("C")) == Some(&addr("B"))
    })
    .await;
    wait_until(&c.0, "C to learn devA behind B", |s| {
        s.identities.get(&id("devA")) == Some(&addr("A")) && s.routes.get(&addr("A")) == Some(&addr("B"))
    })
    .await;

    [a, b, c]
}

#[tokio::test]
async fn test_message_crosses_intermediate_node() {
    let network = MemoryNetwork::new();
    let [(a, _a_events), (b, _b_events), (c, mut c_events)] = line_of_three(&network).await;

    a.send_message(&id("devC"), "hello over two hops").await.unwrap();

    let message = next_message(&mut c_events).await;
    assert_eq!(message.sender, id("devA"));
    assert_eq!(message.content, "hello over two hops");
    assert_eq!(message.via, Some(addr("B")));

    let relay = b.snapshot().await.unwrap();
    assert_eq!(relay.counters.forwarded, 1);
    assert_eq!(relay.counters.delivered, 0);

    let destination = c.snapshot().await.unwrap();
    assert_eq!(destination.counters.delivered, 1);
    assert_eq!(destination.counters.forwarded, 0);
}

#[tokio::test]
async fn test_reply_travels_back() {
    let network = MemoryNetwork::new();
    let [(_a, mut a_events), (_b, _b_events), (c, _c_events)] = line_of_three(&network).await;

    c.send_message(&id("devA"), "pipes | are | fine").await.unwrap();

    let message = next_message(&mut a_events).await;
    assert_eq!(message.sender, id("devC"));
    assert_eq!(message.content, "pipes | are | fine");
}

#[tokio::test]
async fn test_identical_messages_both_arrive() {
    let network = MemoryNetwork::new();
    let [(a, _a_events), (b, _b_events), (_c, mut c_events)] = line_of_three(&network).await;

    a.send_message(&id("devC"), "ok").await.unwrap();
    a.send_message(&id("devC"), "ok").await.unwrap();

    assert_eq!(next_message(&mut c_events).await.content, "ok");
    assert_eq!(next_message(&mut c_events).await.content, "ok");

    let relay = b.snapshot().await.unwrap();
    assert_eq!(relay.counters.forwarded, 2);
    assert_eq!(relay.counters.dropped, 0);
}

#[tokio::test]
async fn test_losing_the_relay_prunes_routes_and_identities() {
    let network = MemoryNetwork::new();
    let [(a, mut a_events), (b, _b_events), (_c, _c_events)] = line_of_three(&network).await;

    b.stop();

    let snapshot = wait_until(&a, "A to drop the relay", |s| s.live_links.is_empty()).await;
    assert!(snapshot.routes.is_empty());
    assert!(snapshot.identities.is_empty());
    assert_eq!(snapshot.known_devices, vec![addr("B")]);

    let result = a.send_message(&id("devC"), "anyone there?").await;
    assert!(matches!(result, Err(MeshError::IdentityMiss(_))));

    let deadline = tokio::time::Instant::now() + WAIT;
    loop {
        let event = tokio::time::timeout_at(deadline, a_events.recv())
            .await
            .expect("no Lost status for B")
            .expect("event channel closed");
        if event == MeshEvent::Status(LinkStatus::Lost { address: addr("B") }) {
            break;
        }
    }
}

#[tokio::test]
async fn test_dial_failure_is_reported_without_retry() {
    let network = MemoryNetwork::new();
    let (a, mut events) = memory_node(&network, "A", "devA").await;

    assert!(matches!(a.dial(&addr("nowhere")).await, Err(MeshError::DialFailed { .. })));

    let event = tokio::time::timeout(WAIT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(
        event,
        MeshEvent::Status(LinkStatus::DialFailed { address, .. }) if address == addr("nowhere")
    ));
}

#[tokio::test]
async fn test_direct_neighbours_over_tcp() {
    let start = |identity: &str| {
        MeshNode::start(
            &MeshConfig::default(),
            Arc::new(TcpTransport::new("127.0.0.1:0", None)),
            Arc::new(MemoryIdentityStore::with_identity(identity)),
        )
        .unwrap()
    };

    let (a, mut a_events) = start("devA");
    let (b, _b_events) = start("devB");
    a.listen().await.unwrap();
    b.listen().await.unwrap();

    let a_address = a.local_address().unwrap();
    b.dial(&a_address).await.unwrap();

    wait_until(&b, "B to learn devA", |s| s.identities.contains_key(&id("devA"))).await;
    b.send_message(&id("devA"), "over tcp").await.unwrap();

    let message = next_message(&mut a_events).await;
    assert_eq!(message.sender, id("devB"));
    assert_eq!(message.content, "over tcp");
    assert_eq!(message.via, b.local_address());
}

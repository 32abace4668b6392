//! Integration tests for chat rooms over the gossip overlay.
//!
//! Most tests run over the in-process memory transport; the last two repeat
//! the basic exchange over loopback TCP and QUIC.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;
use uconnect::{
    ChatMessage, GossipSubConfig, Keypair, MemoryHub, Multiaddr, Node, NodeConfig, NodeEvent, PeerId, topic_for_room,
};

/// Atomic port counter for unique port allocation across parallel tests.
static PORT_COUNTER: AtomicU16 = AtomicU16::new(41000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(2, Ordering::SeqCst)
}

const TEST_TIMEOUT: Duration = Duration::from_secs(15);
const QUIET_PERIOD: Duration = Duration::from_millis(500);

// =============================================================================
// Helper Functions
// =============================================================================

fn fast_gossip() -> GossipSubConfig {
    GossipSubConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..GossipSubConfig::default()
    }
}

async fn memory_node(hub: &Arc<MemoryHub>) -> (Node, mpsc::Receiver<NodeEvent>) {
    let config = NodeConfig {
        gossip: fast_gossip(),
        ..NodeConfig::memory(hub.clone())
    };
    let node = Node::start(Keypair::generate(), config).await.expect("node start failed");
    let events = node.events().await.expect("events already taken");
    (node, events)
}

async fn connect(from: &Node, to: &Node) {
    let addr = to.addresses().into_iter().next().expect("node has an address");
    let peer = from.dial(&addr).await.expect("dial failed");
    assert_eq!(peer, to.local_peer_id());
}

/// Wait until `node` knows every peer in `peers` is subscribed to `topic`.
async fn wait_for_topic_peers(node: &Node, topic: &str, peers: &[PeerId]) {
    timeout(TEST_TIMEOUT, async {
        loop {
            let known = node.topic_peers(topic).await;
            if peers.iter().all(|p| known.contains(p)) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("subscriptions not propagated");
}

async fn wait_for_mesh(node: &Node, topic: &str, min: usize) {
    timeout(TEST_TIMEOUT, async {
        loop {
            if node.mesh_peers(topic).await.len() >= min {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("mesh did not form");
}

async fn next_chat(events: &mut mpsc::Receiver<NodeEvent>) -> (String, PeerId, ChatMessage) {
    timeout(TEST_TIMEOUT, async {
        loop {
            match events.recv().await.expect("event channel closed") {
                NodeEvent::Chat { room, source, message } => return (room, source, message),
                _ => continue,
            }
        }
    })
    .await
    .expect("no chat message arrived")
}

/// Chat messages arriving within the quiet period.
async fn drain_chats(events: &mut mpsc::Receiver<NodeEvent>) -> Vec<ChatMessage> {
    let mut chats = Vec::new();
    let deadline = tokio::time::Instant::now() + QUIET_PERIOD;
    while let Ok(Some(event)) = tokio::time::timeout_at(deadline, events.recv()).await {
        if let NodeEvent::Chat { message, .. } = event {
            chats.push(message);
        }
    }
    chats
}

// =============================================================================
// Test: exactly-once delivery in a room
// =============================================================================

#[tokio::test]
async fn two_peers_in_room1_receive_hi_exactly_once() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = memory_node(&hub).await;
    let (bob, mut bob_events) = memory_node(&hub).await;

    let topic = alice.join_room("room1").await.unwrap();
    bob.join_room("room1").await.unwrap();
    assert_eq!(topic, "universal-connectivity/room1");

    connect(&bob, &alice).await;
    wait_for_topic_peers(&alice, &topic, &[bob.local_peer_id()]).await;

    alice.send_chat("room1", "hi").await.unwrap();

    let (room, source, message) = next_chat(&mut bob_events).await;
    assert_eq!(room, "room1");
    assert_eq!(source, alice.local_peer_id());
    assert_eq!(message.text, "hi");
    assert_eq!(message.sender, alice.nick());

    assert!(drain_chats(&mut bob_events).await.is_empty(), "duplicate delivery");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn message_sent_to_empty_room_reaches_late_joiner() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = memory_node(&hub).await;
    let (bob, mut bob_events) = memory_node(&hub).await;

    let topic = alice.join_room("room1").await.unwrap();
    alice.send_chat("room1", "hi").await.expect("publish with no peers succeeds");
    assert!(alice.mesh_peers(&topic).await.is_empty());

    bob.join_room("room1").await.unwrap();
    connect(&bob, &alice).await;
    wait_for_topic_peers(&alice, &topic, &[bob.local_peer_id()]).await;

    let (room, source, message) = next_chat(&mut bob_events).await;
    assert_eq!(room, "room1");
    assert_eq!(source, alice.local_peer_id());
    assert_eq!(message.text, "hi");
    assert!(drain_chats(&mut bob_events).await.is_empty(), "duplicate delivery");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn reader_that_falls_behind_loses_no_chat_messages() {
    let hub = MemoryHub::new();
    let (alice, _alice_events) = memory_node(&hub).await;
    let config = NodeConfig {
        gossip: fast_gossip(),
        event_buffer: 4,
        ..NodeConfig::memory(hub.clone())
    };
    let bob = Node::start(Keypair::generate(), config).await.unwrap();
    let mut bob_events = bob.events().await.unwrap();

    let topic = alice.join_room("backlog").await.unwrap();
    bob.join_room("backlog").await.unwrap();
    connect(&bob, &alice).await;
    wait_for_topic_peers(&alice, &topic, &[bob.local_peer_id()]).await;

    let mut expected: Vec<String> = (0..20).map(|i| format!("msg {i}")).collect();
    for text in &expected {
        alice.send_chat("backlog", text).await.unwrap();
    }
    // Nobody reads while the buffer overflows.
    tokio::time::sleep(QUIET_PERIOD).await;

    let mut received = Vec::new();
    while received.len() < expected.len() {
        let (_, source, message) = next_chat(&mut bob_events).await;
        assert_eq!(source, alice.local_peer_id());
        received.push(message.text);
    }
    received.sort();
    expected.sort();
    assert_eq!(received, expected);
    assert!(drain_chats(&mut bob_events).await.is_empty(), "duplicate delivery");

    alice.shutdown().await;
    bob.shutdown().await;
}

#[tokio::test]
async fn publisher_does_not_receive_own_messages() {
    let hub = MemoryHub::new();
    let (alice, mut alice_events) = memory_node(&hub).await;
    let (bob, mut bob_events) = memory_node(&hub).await;

    alice.join_room("lobby").await.unwrap();
    bob.join_room("lobby").await.unwrap();
    connect(&alice, &bob).await;
    wait_for_topic_peers(&alice, &topic_for_room("lobby"), &[bob.local_peer_id()]).await;

    alice.send_chat("lobby", "echo?").await.unwrap();
    next_chat(&mut bob_events).await;
    assert!(drain_chats(&mut alice_events).await.is_empty());
}

// =============================================================================
// Test: propagation through an intermediate peer
// =============================================================================

#[tokio::test]
async fn chain_topology_propagation() {
    let hub = MemoryHub::new();
    let (a, _a_events) = memory_node(&hub).await;
    let (b, _b_events) = memory_node(&hub).await;
    let (c, mut c_events) = memory_node(&hub).await;

    for node in [&a, &b, &c] {
        node.join_room("chain").await.unwrap();
    }
    // A - B - C
    connect(&a, &b).await;
    connect(&c, &b).await;

    let topic = topic_for_room("chain");
    wait_for_mesh(&b, &topic, 2).await;
    wait_for_mesh(&a, &topic, 1).await;

    a.send_chat("chain", "over the hop").await.unwrap();
    let (_, source, message) = next_chat(&mut c_events).await;
    assert_eq!(source, a.local_peer_id());
    assert_eq!(message.text, "over the hop");
    assert!(drain_chats(&mut c_events).await.is_empty(), "duplicate delivery");
}

#[tokio::test]
async fn five_node_star_broadcast() {
    let hub = MemoryHub::new();
    let (hub_node, _hub_events) = memory_node(&hub).await;
    hub_node.join_room("star").await.unwrap();

    let mut leaves = Vec::new();
    for _ in 0..4 {
        let (leaf, events) = memory_node(&hub).await;
        leaf.join_room("star").await.unwrap();
        connect(&leaf, &hub_node).await;
        leaves.push((leaf, events));
    }
    let topic = topic_for_room("star");
    wait_for_mesh(&hub_node, &topic, 4).await;

    let (sender, _) = &leaves[0];
    wait_for_mesh(sender, &topic, 1).await;
    sender.send_chat("star", "to everyone").await.unwrap();

    for (_, events) in leaves.iter_mut().skip(1) {
        let (_, _, message) = next_chat(events).await;
        assert_eq!(message.text, "to everyone");
        assert!(drain_chats(events).await.is_empty(), "duplicate delivery");
    }
}

// =============================================================================
// Test: rooms, legacy payloads and plain topics
// =============================================================================

#[tokio::test]
async fn rooms_are_isolated() {
    let hub = MemoryHub::new();
    let (a, _a_events) = memory_node(&hub).await;
    let (b, mut b_events) = memory_node(&hub).await;

    a.join_room("room1").await.unwrap();
    a.join_room("room2").await.unwrap();
    b.join_room("room1").await.unwrap();
    connect(&a, &b).await;
    wait_for_topic_peers(&a, &topic_for_room("room1"), &[b.local_peer_id()]).await;

    a.send_chat("room2", "not for bob").await.unwrap();
    a.send_chat("room1", "for bob").await.unwrap();

    let (room, _, message) = next_chat(&mut b_events).await;
    assert_eq!(room, "room1");
    assert_eq!(message.text, "for bob");
    assert!(drain_chats(&mut b_events).await.is_empty());
}

#[tokio::test]
async fn plain_text_payload_is_attributed_to_publisher() {
    let hub = MemoryHub::new();
    let (a, _a_events) = memory_node(&hub).await;
    let (b, mut b_events) = memory_node(&hub).await;

    let topic = a.join_room("").await.unwrap();
    b.join_room("default").await.unwrap();
    assert_eq!(topic, "universal-connectivity");
    connect(&a, &b).await;
    wait_for_topic_peers(&a, &topic, &[b.local_peer_id()]).await;

    a.publish(&topic, b"hello from a legacy peer".to_vec()).await.unwrap();

    let (room, source, message) = next_chat(&mut b_events).await;
    assert_eq!(room, "default");
    assert_eq!(message.sender, a.local_peer_id().short());
    assert_eq!(message.text, "hello from a legacy peer");
    assert_eq!(source, a.local_peer_id());
}

#[tokio::test]
async fn non_chat_topic_delivered_as_raw_message() {
    let hub = MemoryHub::new();
    let (a, _a_events) = memory_node(&hub).await;
    let (b, mut b_events) = memory_node(&hub).await;

    a.subscribe("telemetry").await.unwrap();
    b.subscribe("telemetry").await.unwrap();
    connect(&a, &b).await;
    wait_for_topic_peers(&a, "telemetry", &[b.local_peer_id()]).await;

    a.publish("telemetry", vec![0xde, 0xad]).await.unwrap();

    let received = timeout(TEST_TIMEOUT, async {
        loop {
            if let Some(NodeEvent::Message(msg)) = b_events.recv().await {
                return msg;
            }
        }
    })
    .await
    .expect("message not delivered");
    assert_eq!(received.topic, "telemetry");
    assert_eq!(received.data, vec![0xde, 0xad]);
    assert_eq!(received.source, a.local_peer_id());
}

#[tokio::test]
async fn leaving_a_room_stops_delivery() {
    let hub = MemoryHub::new();
    let (a, _a_events) = memory_node(&hub).await;
    let (b, mut b_events) = memory_node(&hub).await;

    a.join_room("temp").await.unwrap();
    b.join_room("temp").await.unwrap();
    connect(&a, &b).await;
    let topic = topic_for_room("temp");
    wait_for_topic_peers(&a, &topic, &[b.local_peer_id()]).await;

    b.leave_room("temp").await.unwrap();
    timeout(TEST_TIMEOUT, async {
        while a.topic_peers(&topic).await.contains(&b.local_peer_id()) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("unsubscribe not propagated");

    a.send_chat("temp", "anyone?").await.unwrap();
    assert!(drain_chats(&mut b_events).await.is_empty());
}

// =============================================================================
// Test: real transports
// =============================================================================

async fn loopback_node(tcp: bool) -> (Node, mpsc::Receiver<NodeEvent>) {
    let port = next_port();
    let addr = if tcp {
        Multiaddr::tcp(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    } else {
        Multiaddr::quic(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))
    };
    let config = NodeConfig {
        listen_addrs: vec![addr],
        enable_tcp: tcp,
        enable_quic: !tcp,
        gossip: fast_gossip(),
        ..NodeConfig::default()
    };
    let node = Node::start(Keypair::generate(), config).await.expect("node start failed");
    let events = node.events().await.unwrap();
    (node, events)
}

async fn chat_over_loopback(tcp: bool) {
    let (a, _a_events) = loopback_node(tcp).await;
    let (b, mut b_events) = loopback_node(tcp).await;

    a.join_room("room1").await.unwrap();
    b.join_room("room1").await.unwrap();
    connect(&b, &a).await;
    wait_for_topic_peers(&a, &topic_for_room("room1"), &[b.local_peer_id()]).await;

    a.send_chat("room1", "hi").await.unwrap();
    let (_, source, message) = next_chat(&mut b_events).await;
    assert_eq!(source, a.local_peer_id());
    assert_eq!(message.text, "hi");
    assert!(drain_chats(&mut b_events).await.is_empty());

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test]
async fn tcp_two_nodes_chat() {
    chat_over_loopback(true).await;
}

#[tokio::test]
async fn quic_two_nodes_chat() {
    chat_over_loopback(false).await;
}

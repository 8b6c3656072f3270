// node/tests.rs - Peer Node Scenarios

use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;

use super::*;
use crate::client::{ClientConfig, ClientError, ClientSession, RetryPolicy};
use crate::network::{RelayConnector, RoutingTableEntry, TcpConnector, acn_framed};
use crate::trust::{LedgerId, LedgerKeyPair};
use crate::wire::{AcnMessage, StatusCode};

const WAIT: Duration = Duration::from_secs(10);

fn local_config() -> NodeConfig {
    let mut config = NodeConfig::local();
    config.dht.rpc_timeout_ms = 2_000;
    config.timeouts.forward_ms = 5_000;
    config
}

async fn start_node(bootstrap: Option<&PeerNode>) -> PeerNode {
    let mut config = local_config();
    if let Some(peer) = bootstrap {
        config = config.with_bootstrap_peer(peer.multiaddr().to_string());
    }
    PeerNode::start(config).await.unwrap()
}

fn delegate_client(node: &PeerNode, agent: &LedgerKeyPair) -> ClientSession {
    let connector = TcpConnector::new(node.delegate_addr().unwrap().to_string());
    ClientSession::from_signer(agent, node.public_key(), connector, ClientConfig::default())
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

async fn wait_resolvable(node: &PeerNode, address: &str) {
    tokio::time::timeout(WAIT, async {
        while node.resolve(address).await.is_err() {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("address never resolved");
}

#[tokio::test]
async fn test_two_node_delivery() {
    let node1 = start_node(None).await;
    let node2 = start_node(Some(&node1)).await;
    assert!(node1.peer_count() >= 1);
    assert!(node2.peer_count() >= 1);

    let agent_a = LedgerKeyPair::generate(LedgerId::Fetchai);
    let agent_b = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client_a = delegate_client(&node1, &agent_a);
    let client_b = delegate_client(&node2, &agent_b);
    client_a.connect().await.unwrap();
    client_b.connect().await.unwrap();
    assert!(node1.is_connected(agent_a.address()));
    assert!(node2.is_connected(agent_b.address()));

    wait_resolvable(&node1, agent_b.address()).await;

    let envelope = Envelope::new(agent_b.address(), agent_a.address(), b"hello".to_vec());
    client_a.send(&envelope).await.unwrap();

    let received = client_b.receive(WAIT).await.unwrap();
    assert_eq!(received.message, b"hello".to_vec());
    assert_eq!(received.sender, agent_a.address());
    assert!(client_b.receive(Duration::from_millis(200)).await.is_none());

    client_a.disconnect().await;
    client_b.disconnect().await;
    node2.shutdown().await;
    node1.shutdown().await;
}

#[tokio::test]
async fn test_local_delivery_on_one_node() {
    let node = start_node(None).await;
    let agent_a = LedgerKeyPair::generate(LedgerId::Ethereum);
    let agent_b = LedgerKeyPair::generate(LedgerId::Cosmos);
    let client_a = delegate_client(&node, &agent_a);
    let client_b = delegate_client(&node, &agent_b);
    client_a.connect().await.unwrap();
    client_b.connect().await.unwrap();

    let envelope = Envelope::new(agent_b.address(), agent_a.address(), b"local".to_vec())
        .with_context("agent://context");
    client_a.send(&envelope).await.unwrap();
    let received = client_b.receive(WAIT).await.unwrap();
    assert_eq!(received, envelope);

    client_a.disconnect().await;
    client_b.disconnect().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_invalid_proof_is_rejected_and_closed() {
    let node = start_node(None).await;
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let mut record = AgentRecord::issue(&agent, node.public_key());
    let forged = AgentRecord::issue(&agent, PeerKeypair::generate().public_key());
    record.signature = forged.signature;

    let stream = TcpStream::connect(node.delegate_addr().unwrap()).await.unwrap();
    let mut framed = acn_framed(Box::new(stream));
    framed.send(AcnMessage::Register(record)).await.unwrap();

    match framed.next().await.unwrap().unwrap() {
        AcnMessage::Status(status) => assert_eq!(status.code, StatusCode::ErrorInvalidProof),
        other => panic!("unexpected {}", other.kind()),
    }
    let closed = tokio::time::timeout(WAIT, framed.next()).await.unwrap();
    assert!(closed.is_none());

    assert!(!node.is_connected(agent.address()));
    assert!(node.state().records.is_empty());
    assert!(node.state().dht.local_providers(agent.address()).is_empty());
    node.shutdown().await;
}

#[tokio::test]
async fn test_garbage_before_register_gets_decode_error() {
    let node = start_node(None).await;
    let stream = TcpStream::connect(node.delegate_addr().unwrap()).await.unwrap();
    let mut framed = tokio_util::codec::Framed::new(stream, crate::wire::RawFrameCodec::new());
    framed
        .send(bytes::Bytes::from_static(&[0xff, 0xff, 0xff]))
        .await
        .unwrap();

    let reply = framed.next().await.unwrap().unwrap();
    match crate::wire::codec::decode_payload(&reply).unwrap() {
        AcnMessage::Status(status) => assert_eq!(status.code, StatusCode::ErrorDecode),
        other => panic!("unexpected {}", other.kind()),
    }
    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_registration_replaces_previous() {
    let node = start_node(None).await;
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let first = delegate_client(&node, &agent);
    let second = delegate_client(&node, &agent);

    first.connect().await.unwrap();
    second.connect().await.unwrap();
    wait_until(|| !first.is_connected()).await;

    assert_eq!(node.connected_addresses(), vec![agent.address().to_string()]);
    assert!(second.is_connected());
    assert!(node.state().records.contains(agent.address()));

    first.disconnect().await;
    second.disconnect().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_duplicate_registration_rejected_by_policy() {
    let config = local_config().with_duplicate_policy(DuplicatePolicy::Reject);
    let node = PeerNode::start(config).await.unwrap();
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let first = delegate_client(&node, &agent);
    let connector = TcpConnector::new(node.delegate_addr().unwrap().to_string());
    let second = ClientSession::from_signer(
        &agent,
        node.public_key(),
        connector,
        ClientConfig::default().with_retry(RetryPolicy::default().with_max_attempts(1)),
    );

    first.connect().await.unwrap();
    let err = second.connect().await.unwrap_err();
    assert!(matches!(err, ClientError::RegistrationFailed { attempts: 1, .. }));
    assert_eq!(err.status_code(), Some(StatusCode::ErrorGeneric));
    assert!(first.is_connected());
    assert_eq!(node.connected_addresses().len(), 1);

    first.disconnect().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_wrong_sender_is_refused_but_session_stays() {
    let node = start_node(None).await;
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client = delegate_client(&node, &agent);
    client.connect().await.unwrap();

    let spoofed = Envelope::new(agent.address(), "fetch1impostor", b"x".to_vec());
    let err = client.send(&spoofed).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::ErrorWrongAgentAddress));
    assert!(client.is_connected());

    let unknown = LedgerKeyPair::generate(LedgerId::Fetchai);
    let envelope = Envelope::new(unknown.address(), agent.address(), b"x".to_vec());
    let err = client.send(&envelope).await.unwrap_err();
    assert_eq!(err.status_code(), Some(StatusCode::ErrorUnknownAgentAddress));
    assert!(client.is_connected());

    client.disconnect().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_relay_client_receives_forwarded_envelope() {
    let node1 = start_node(None).await;
    let node2 = start_node(Some(&node1)).await;

    let relay_peer = PeerKeypair::generate();
    let relay_agent = LedgerKeyPair::generate(LedgerId::Ethereum);
    let relay = ClientSession::from_signer(
        &relay_agent,
        relay_peer.public_key(),
        RelayConnector::new(node1.multiaddr(), relay_peer.clone()),
        ClientConfig::default(),
    );
    relay.connect().await.unwrap();
    assert_eq!(node1.state().sessions.count(ServiceKind::Relay), 1);

    let sender = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client = delegate_client(&node2, &sender);
    client.connect().await.unwrap();
    wait_resolvable(&node2, relay_agent.address()).await;

    let envelope = Envelope::new(relay_agent.address(), sender.address(), b"via relay".to_vec());
    client.send(&envelope).await.unwrap();
    let received = relay.receive(WAIT).await.unwrap();
    assert_eq!(received.message, b"via relay".to_vec());

    relay.disconnect().await;
    client.disconnect().await;
    node2.shutdown().await;
    node1.shutdown().await;
}

#[tokio::test]
async fn test_relay_record_with_bad_peer_key_is_refused() {
    let node = start_node(None).await;
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let session = ClientSession::from_signer(
        &agent,
        "02not-a-peer-key",
        RelayConnector::new(node.multiaddr(), PeerKeypair::generate()),
        ClientConfig::default(),
    );
    // The record is self-consistent, so only the node can refuse it
    let err = session.connect().await.unwrap_err();
    assert!(err.is_unrecoverable());
    assert_eq!(err.status_code(), Some(StatusCode::ErrorWrongPublicKey));
    node.shutdown().await;
}

#[tokio::test]
async fn test_relay_record_replayed_without_peer_key_is_refused() {
    let node = start_node(None).await;
    let relay_peer = PeerKeypair::generate();
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let owner = ClientSession::from_signer(
        &agent,
        relay_peer.public_key(),
        RelayConnector::new(node.multiaddr(), relay_peer.clone()),
        ClientConfig::default(),
    );
    owner.connect().await.unwrap();

    // Same record, but the connecting client only holds its own peer key
    let replayed = ClientSession::new(
        owner.record().clone(),
        RelayConnector::new(node.multiaddr(), PeerKeypair::generate()),
        ClientConfig::default(),
    );
    let err = replayed.connect().await.unwrap_err();
    assert!(err.is_unrecoverable());
    assert_eq!(err.status_code(), Some(StatusCode::ErrorWrongPublicKey));

    assert!(owner.is_connected());
    assert_eq!(node.state().sessions.count(ServiceKind::Relay), 1);
    let to_self = Envelope::new(agent.address(), agent.address(), b"still mine".to_vec());
    owner.send(&to_self).await.unwrap();
    assert_eq!(owner.receive(WAIT).await.unwrap().message, b"still mine".to_vec());

    owner.disconnect().await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_agent_is_not_ready_when_persisted() {
    let dir = tempfile::tempdir().unwrap();
    let node = PeerNode::start(local_config().with_record_store(dir.path())).await.unwrap();
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client = delegate_client(&node, &agent);
    client.connect().await.unwrap();
    client.disconnect().await;
    wait_until(|| !node.is_connected(agent.address())).await;

    let envelope = Envelope::new(agent.address(), "fetch1someone", b"x".to_vec());
    let status = node.route(envelope.clone()).await;
    assert_eq!(status.code, StatusCode::ErrorAgentNotReady);

    assert!(node.deregister(agent.address()).unwrap());
    let status = node.route(envelope).await;
    assert_eq!(status.code, StatusCode::ErrorUnknownAgentAddress);
    node.shutdown().await;
}

#[tokio::test]
async fn test_disconnected_agent_is_forgotten_without_persistence() {
    let node = start_node(None).await;
    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client = delegate_client(&node, &agent);
    client.connect().await.unwrap();
    assert!(node.state().records.contains(agent.address()));

    client.disconnect().await;
    wait_until(|| !node.state().records.contains(agent.address())).await;
    node.shutdown().await;
}

#[tokio::test]
async fn test_bootstrap_to_dead_peer_fails_startup() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead = listener.local_addr().unwrap();
    drop(listener);

    let ghost = PeerKeypair::generate();
    let mut config = local_config()
        .with_bootstrap_peer(format!("/ip4/127.0.0.1/tcp/{}/p2p/{}", dead.port(), ghost.peer_id()));
    config.dht.rpc_timeout_ms = 500;
    assert!(matches!(
        PeerNode::start(config).await,
        Err(NodeError::Discovery(crate::network::DiscoveryError::BootstrapFailed(1)))
    ));
}

#[tokio::test]
async fn test_lookup_converges_across_eight_nodes() {
    let mut nodes: Vec<PeerNode> = Vec::new();
    for i in 0..8 {
        let node = start_node(if i == 0 { None } else { nodes.last() }).await;
        nodes.push(node);
    }

    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let client = delegate_client(&nodes[7], &agent);
    client.connect().await.unwrap();

    for node in &nodes {
        wait_resolvable(node, agent.address()).await;
        let record = node.resolve(agent.address()).await.unwrap();
        assert_eq!(record.address, agent.address());
        assert_eq!(record.peer_public_key, nodes[7].public_key());
    }

    // A late joiner holds no provider record and has to walk the DHT
    let joiner = start_node(Some(&nodes[0])).await;
    let outcome = joiner.state().dht.find_providers(agent.address()).await;
    assert_eq!(outcome.providers.len(), 1);
    assert_eq!(outcome.providers[0].peer_id, nodes[7].peer_id());
    assert!(outcome.hops <= 4, "took {} hops", outcome.hops);
    let record = joiner.resolve(agent.address()).await.unwrap();
    assert_eq!(record.address, agent.address());

    client.disconnect().await;
    joiner.shutdown().await;
    for node in nodes {
        node.shutdown().await;
    }
}

#[tokio::test]
async fn test_slow_route_does_not_take_next_acknowledgement() {
    let mut config = local_config();
    config.dht.rpc_timeout_ms = 3_000;
    let node = PeerNode::start(config).await.unwrap();

    // Accepts DHT streams and never answers
    let silent = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = crate::network::transport::socket_multiaddr(silent.local_addr().unwrap());
    let hold = tokio::spawn(async move {
        let mut streams = Vec::new();
        while let Ok((stream, _)) = silent.accept().await {
            streams.push(stream);
        }
    });
    let silent_peer = PeerKeypair::generate();
    node.state()
        .dht
        .observe(RoutingTableEntry::new(
            silent_peer.peer_id(),
            silent_peer.public_key(),
            vec![silent_addr],
        ))
        .await;

    let agent = LedgerKeyPair::generate(LedgerId::Fetchai);
    let connector = TcpConnector::new(node.delegate_addr().unwrap().to_string());
    let client = ClientSession::from_signer(
        &agent,
        node.public_key(),
        connector,
        ClientConfig::default().with_ack_timeout(Duration::from_secs(2)),
    );
    client.connect().await.unwrap();

    let unknown = LedgerKeyPair::generate(LedgerId::Fetchai);
    let slow = Envelope::new(unknown.address(), agent.address(), b"A".to_vec());
    assert!(matches!(client.send(&slow).await, Err(ClientError::Timeout(_))));

    let to_self = Envelope::new(agent.address(), agent.address(), b"B".to_vec());
    client.send(&to_self).await.unwrap();
    let received = client.receive(WAIT).await.unwrap();
    assert_eq!(received.message, b"B".to_vec());
    assert!(client.is_connected());

    client.disconnect().await;
    hold.abort();
    node.shutdown().await;
}

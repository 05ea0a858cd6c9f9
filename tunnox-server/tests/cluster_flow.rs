//! Cross-node flows: a tunnel whose two agents sit on different nodes,
//! broker-based client location, and pool exhaustion. Two in-process
//! nodes share one auth store, mapping store, node registry, and broker —
//! the same wiring a real cluster gets from its management plane.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use tunnox_protocol::packet::{
    HandshakeRequest, PacketType, TransferPacket, TunnelDataPayload, TunnelOpenRequest,
};
use tunnox_server::cluster::broker::MemoryBroker;
use tunnox_server::config::GatewayConfig;
use tunnox_server::error::GatewayError;
use tunnox_server::state::AppState;
use tunnox_server::stores::{
    Client, MemoryAuthStore, MemoryMappingStore, MemoryNodeRegistry, NodeEntry, PortMapping,
};
use tunnox_server::stream::{FramedStream, PacketStream};
use tunnox_server::transport::tcp;

type Agent = FramedStream<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

/// Reserves a loopback address for a listener the node will bind itself.
fn free_addr() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);
    addr
}

struct TwoNodes {
    node_a: AppState,
    node_b: AppState,
    agents_a: SocketAddr,
    agents_b: SocketAddr,
}

async fn start_two_nodes(pool_max_conns: usize, pool_max_streams: usize) -> TwoNodes {
    let auth = Arc::new(MemoryAuthStore::new());
    for id in [5i64, 77] {
        auth.insert(Client {
            id,
            name: format!("agent-{id}"),
            auth_token: format!("token-{id}"),
            enabled: true,
        });
    }
    let mappings = Arc::new(MemoryMappingStore::new());
    mappings.insert(PortMapping {
        id: "m1".into(),
        listen_client_id: 5,
        target_client_id: 77,
        protocol: "tcp".into(),
        target_host: "127.0.0.1".into(),
        target_port: 8080,
        source_port: 18080,
        bandwidth_bps: 0,
        max_conns: 0,
        enabled: true,
    });
    let nodes = Arc::new(MemoryNodeRegistry::new());
    let broker = Arc::new(MemoryBroker::new());

    let cluster_a = free_addr();
    let cluster_b = free_addr();
    nodes.insert_node(NodeEntry {
        node_id: "node-a".into(),
        address: cluster_a.clone(),
    });
    nodes.insert_node(NodeEntry {
        node_id: "node-b".into(),
        address: cluster_b.clone(),
    });

    let mut boot = Vec::new();
    for (node_id, cluster_listen) in [("node-a", cluster_a), ("node-b", cluster_b)] {
        let mut config = GatewayConfig::default();
        config.node_id = node_id.into();
        config.tcp_listen = String::new();
        config.quic_listen = String::new();
        config.cluster_listen = cluster_listen;
        config.pool.max_conns = pool_max_conns;
        config.pool.max_streams_per_conn = pool_max_streams;

        let state = AppState::build_with_stores(
            Arc::new(config),
            Arc::clone(&auth) as _,
            Arc::clone(&mappings) as _,
            Arc::clone(&nodes) as _,
            Arc::clone(&broker) as _,
        );
        state.cluster.start().await.unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agents_addr = listener.local_addr().unwrap();
        tokio::spawn(tcp::serve(Arc::clone(&state.sessions), listener));
        boot.push((state, agents_addr));
    }

    let (node_b, agents_b) = boot.pop().unwrap();
    let (node_a, agents_a) = boot.pop().unwrap();
    TwoNodes {
        node_a,
        node_b,
        agents_a,
        agents_b,
    }
}

async fn connect_agent(addr: SocketAddr, client_id: i64) -> Agent {
    let socket = TcpStream::connect(addr).await.unwrap();
    let (read_half, write_half) = socket.into_split();
    let agent = FramedStream::new(read_half, write_half);
    agent
        .write_packet(TransferPacket::handshake(&HandshakeRequest {
            client_id,
            auth_token: format!("token-{client_id}"),
            connection_id: None,
            version: "test".into(),
        }))
        .await
        .unwrap();
    let ack = agent
        .read_packet()
        .await
        .unwrap()
        .parse_handshake_ack()
        .unwrap();
    assert!(ack.success);
    agent
}

async fn read_with_deadline(agent: &Agent) -> TransferPacket {
    tokio::time::timeout(Duration::from_secs(3), agent.read_packet())
        .await
        .expect("read timed out")
        .expect("stream closed")
}

#[tokio::test]
async fn cross_node_tunnel_opens_forwards_and_aborts() {
    let cluster = start_two_nodes(4, 64).await;
    let agent5 = connect_agent(cluster.agents_a, 5).await;
    let agent77 = connect_agent(cluster.agents_b, 77).await;

    // Node A must forward the open to node B, which asks agent 77 to
    // dial and acks the stream.
    agent5
        .write_packet(TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: "m1".into(),
            protocol: "tcp".into(),
        }))
        .await
        .unwrap();

    let ack = read_with_deadline(&agent5)
        .await
        .parse_tunnel_open_ack()
        .unwrap();
    assert!(ack.success, "cross-node open failed: {:?}", ack.error);

    let notify = read_with_deadline(&agent77).await;
    assert_eq!(notify.packet_type, PacketType::TunnelOpen);
    assert_eq!(notify.parse_tunnel_open().unwrap().mapping_id, "m1");

    // Bridges exist on both nodes.
    assert!(cluster.node_a.sessions.bridge_by_mapping("m1").is_some());
    assert!(cluster.node_b.sessions.bridge_by_mapping("m1").is_some());

    // Forwarded bytes cross the node link in both directions.
    agent5
        .write_packet(TransferPacket::tunnel_data(&TunnelDataPayload::new(
            "m1",
            b"ping".to_vec(),
        )))
        .await
        .unwrap();
    let forwarded = read_with_deadline(&agent77).await.parse_tunnel_data().unwrap();
    assert_eq!(forwarded.data, b"ping");

    agent77
        .write_packet(TransferPacket::tunnel_data(&TunnelDataPayload::new(
            "m1",
            b"pong".to_vec(),
        )))
        .await
        .unwrap();
    let forwarded = read_with_deadline(&agent5).await.parse_tunnel_data().unwrap();
    assert_eq!(forwarded.data, b"pong");

    // Injecting a disconnect on B's side must close both ends within 1s.
    agent77.close().await;
    drop(agent77);

    let packet = tokio::time::timeout(Duration::from_secs(1), agent5.read_packet())
        .await
        .expect("no tunnel close within 1s")
        .unwrap();
    assert_eq!(packet.packet_type, PacketType::TunnelClose);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(cluster.node_a.sessions.bridge_by_mapping("m1").is_none());
    assert!(cluster.node_b.sessions.bridge_by_mapping("m1").is_none());
}

#[tokio::test]
async fn the_broker_locates_clients_across_nodes() {
    let cluster = start_two_nodes(4, 64).await;
    let _agent77 = connect_agent(cluster.agents_b, 77).await;

    // Node A has never seen client 77; the locate request finds node B.
    let owner = cluster.node_a.cluster.locate_client(77).await;
    assert_eq!(owner.as_deref(), Some("node-b"));
    assert!(cluster.node_b.sessions.control_connection(77).is_some());
}

#[tokio::test]
async fn an_exhausted_pool_refuses_new_streams() {
    let cluster = start_two_nodes(1, 1).await;
    let _agent77 = connect_agent(cluster.agents_b, 77).await;

    let mapping = PortMapping {
        id: "m1".into(),
        listen_client_id: 5,
        target_client_id: 77,
        protocol: "tcp".into(),
        target_host: "127.0.0.1".into(),
        target_port: 8080,
        source_port: 18080,
        bandwidth_bps: 0,
        max_conns: 0,
        enabled: true,
    };

    // One link, one stream per link: the first session takes the slot.
    let session = cluster
        .node_a
        .cluster
        .open_remote_tunnel(&mapping, 77, "node-b", "tcp")
        .await
        .unwrap();
    assert_eq!(session.mapping_id(), "m1");

    let second = cluster
        .node_a
        .cluster
        .open_remote_tunnel(&mapping, 77, "node-b", "tcp")
        .await;
    assert!(matches!(second, Err(GatewayError::PoolExhausted(_))));
}

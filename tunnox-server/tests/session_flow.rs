//! Session-layer flows over the native TCP transport: handshake, local
//! tunnel bridging between two agents, connection caps, teardown on
//! disconnect, and command fan-out.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

use tunnox_protocol::packet::{
    CommandType, HandshakeRequest, PacketType, TransferPacket, TunnelCloseNotice,
    TunnelDataPayload, TunnelOpenRequest,
};
use tunnox_server::cluster::broker::{Broker, MemoryBroker};
use tunnox_server::config::GatewayConfig;
use tunnox_server::session::fanout::{FanoutEnvelope, PUSH_BROADCAST_TOPIC};
use tunnox_server::state::AppState;
use tunnox_server::stores::{
    Client, MemoryAuthStore, MemoryMappingStore, MemoryNodeRegistry, PortMapping,
};
use tunnox_server::stream::{FramedStream, PacketStream};
use tunnox_server::transport::tcp;

type Agent = FramedStream<tokio::net::tcp::OwnedReadHalf, tokio::net::tcp::OwnedWriteHalf>;

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.node_id = "node-test".into();
    config.tcp_listen = String::new();
    config.quic_listen = String::new();
    config.cluster_listen = String::new();
    config
}

fn stores() -> (
    Arc<MemoryAuthStore>,
    Arc<MemoryMappingStore>,
    Arc<MemoryNodeRegistry>,
    Arc<MemoryBroker>,
) {
    let auth = MemoryAuthStore::new();
    for id in [1i64, 2] {
        auth.insert(Client {
            id,
            name: format!("agent-{id}"),
            auth_token: format!("token-{id}"),
            enabled: true,
        });
    }
    let mappings = MemoryMappingStore::new();
    mappings.insert(PortMapping {
        id: "m1".into(),
        listen_client_id: 1,
        target_client_id: 2,
        protocol: "tcp".into(),
        target_host: "127.0.0.1".into(),
        target_port: 22,
        source_port: 2022,
        bandwidth_bps: 0,
        max_conns: 2,
        enabled: true,
    });
    (
        Arc::new(auth),
        Arc::new(mappings),
        Arc::new(MemoryNodeRegistry::new()),
        Arc::new(MemoryBroker::new()),
    )
}

async fn start_node() -> (AppState, std::net::SocketAddr) {
    let (auth, mappings, nodes, broker) = stores();
    let state = AppState::build_with_stores(Arc::new(test_config()), auth, mappings, nodes, broker);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(tcp::serve(Arc::clone(&state.sessions), listener));
    (state, addr)
}

async fn connect_agent(addr: std::net::SocketAddr, client_id: i64) -> Agent {
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
    assert!(ack.success, "handshake for client {client_id} failed");
    agent
}

async fn read_with_deadline(agent: &Agent) -> TransferPacket {
    tokio::time::timeout(Duration::from_secs(2), agent.read_packet())
        .await
        .expect("read timed out")
        .expect("stream closed")
}

#[tokio::test]
async fn two_agents_bridge_and_exchange_data() {
    let (state, addr) = start_node().await;
    let agent1 = connect_agent(addr, 1).await;
    let agent2 = connect_agent(addr, 2).await;

    // Agent 1 opens the tunnel; agent 2 is told to dial its target.
    agent1
        .write_packet(TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: "m1".into(),
            protocol: "tcp".into(),
        }))
        .await
        .unwrap();

    let ack = read_with_deadline(&agent1)
        .await
        .parse_tunnel_open_ack()
        .unwrap();
    assert!(ack.success, "tunnel open failed: {:?}", ack.error);

    let notify = read_with_deadline(&agent2).await;
    assert_eq!(notify.packet_type, PacketType::TunnelOpen);
    assert_eq!(notify.parse_tunnel_open().unwrap().mapping_id, "m1");

    // Data flows both ways through the bridge.
    agent1
        .write_packet(TransferPacket::tunnel_data(&TunnelDataPayload::new(
            "m1",
            b"ping".to_vec(),
        )))
        .await
        .unwrap();
    let forwarded = read_with_deadline(&agent2).await.parse_tunnel_data().unwrap();
    assert_eq!(forwarded.data, b"ping");

    agent2
        .write_packet(TransferPacket::tunnel_data(&TunnelDataPayload::new(
            "m1",
            b"pong".to_vec(),
        )))
        .await
        .unwrap();
    let forwarded = read_with_deadline(&agent1).await.parse_tunnel_data().unwrap();
    assert_eq!(forwarded.data, b"pong");

    let bridge = state.sessions.bridge_by_mapping("m1").unwrap();
    let stats = bridge.stats();
    assert_eq!(stats.bytes_in + stats.bytes_out, 8);

    // The bridge is also reachable through either connection's id.
    let conn1 = state.sessions.control_connection(1).unwrap();
    let by_conn = state.sessions.bridge_by_connection(conn1.id()).unwrap();
    assert_eq!(by_conn.mapping_id(), "m1");
}

#[tokio::test]
async fn connection_caps_surface_as_quota_errors() {
    let (_state, addr) = start_node().await;
    let agent1 = connect_agent(addr, 1).await;
    let agent2 = connect_agent(addr, 2).await;

    let open = TransferPacket::tunnel_open(&TunnelOpenRequest {
        mapping_id: "m1".into(),
        protocol: "tcp".into(),
    });

    // First open creates the bridge (1/2) and notifies the peer.
    agent1.write_packet(open.clone()).await.unwrap();
    assert!(read_with_deadline(&agent1)
        .await
        .parse_tunnel_open_ack()
        .unwrap()
        .success);
    let _ = read_with_deadline(&agent2).await;

    // Second open attaches (2/2).
    agent1.write_packet(open.clone()).await.unwrap();
    assert!(read_with_deadline(&agent1)
        .await
        .parse_tunnel_open_ack()
        .unwrap()
        .success);

    // Third open exceeds the cap: rejected, never silently dropped.
    agent1.write_packet(open).await.unwrap();
    let ack = read_with_deadline(&agent1)
        .await
        .parse_tunnel_open_ack()
        .unwrap();
    assert!(!ack.success);
    assert!(ack.error.unwrap().contains("quota"), "expected quota error");
}

#[tokio::test]
async fn unknown_and_foreign_mappings_are_rejected() {
    let (_state, addr) = start_node().await;
    let agent1 = connect_agent(addr, 1).await;

    agent1
        .write_packet(TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: "no-such".into(),
            protocol: "tcp".into(),
        }))
        .await
        .unwrap();
    let ack = read_with_deadline(&agent1)
        .await
        .parse_tunnel_open_ack()
        .unwrap();
    assert!(!ack.success);
    assert!(ack.error.unwrap().contains("unknown mapping"));
}

#[tokio::test]
async fn tunnel_close_tears_the_bridge_down_for_the_peer() {
    let (state, addr) = start_node().await;
    let agent1 = connect_agent(addr, 1).await;
    let agent2 = connect_agent(addr, 2).await;

    agent1
        .write_packet(TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: "m1".into(),
            protocol: "tcp".into(),
        }))
        .await
        .unwrap();
    let _ = read_with_deadline(&agent1).await;
    let _ = read_with_deadline(&agent2).await;

    agent1
        .write_packet(TransferPacket::tunnel_close(&TunnelCloseNotice {
            mapping_id: "m1".into(),
            reason: "done".into(),
        }))
        .await
        .unwrap();

    let close = read_with_deadline(&agent2).await.parse_tunnel_close().unwrap();
    assert_eq!(close.mapping_id, "m1");
    // Give the session a beat to drop the table entry.
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(state.sessions.bridge_by_mapping("m1").is_none());
}

#[tokio::test]
async fn peer_disconnect_closes_the_bridge_within_a_second() {
    let (state, addr) = start_node().await;
    let agent1 = connect_agent(addr, 1).await;
    let agent2 = connect_agent(addr, 2).await;

    agent1
        .write_packet(TransferPacket::tunnel_open(&TunnelOpenRequest {
            mapping_id: "m1".into(),
            protocol: "tcp".into(),
        }))
        .await
        .unwrap();
    let _ = read_with_deadline(&agent1).await;
    let _ = read_with_deadline(&agent2).await;

    // Kill agent 2's socket; the gateway must notify agent 1 promptly.
    agent2.close().await;
    drop(agent2);

    let packet = tokio::time::timeout(Duration::from_secs(1), agent1.read_packet())
        .await
        .expect("no tunnel close within 1s")
        .unwrap();
    assert_eq!(packet.packet_type, PacketType::TunnelClose);
    assert!(state.sessions.control_connection(2).is_none());
}

#[tokio::test]
async fn fanout_reaches_a_local_client_and_kicks_work() {
    let (state, addr) = start_node().await;
    state.cluster.start().await.unwrap();
    let agent1 = connect_agent(addr, 1).await;

    state
        .fanout
        .push_config(1, "{\"mapping_id\":\"m1\"}".into())
        .await
        .unwrap();
    let packet = read_with_deadline(&agent1).await;
    let command = packet.command.unwrap();
    assert_eq!(command.command_type, CommandType::ConfigSet);
    assert_eq!(command.command_body, "{\"mapping_id\":\"m1\"}");

    // A kick delivers the command, then closes the connection.
    state.fanout.kick_client(1, "operator request").await.unwrap();
    let packet = read_with_deadline(&agent1).await;
    assert_eq!(packet.command.unwrap().command_type, CommandType::KickClient);

    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(state.sessions.control_connection(1).is_none());
}

#[tokio::test]
async fn fanout_for_an_offline_client_broadcasts_and_succeeds() {
    let (auth, mappings, nodes, broker) = stores();
    let state = AppState::build_with_stores(
        Arc::new(test_config()),
        auth,
        mappings,
        nodes,
        Arc::clone(&broker) as Arc<dyn Broker>,
    );
    state.cluster.start().await.unwrap();

    let mut watcher = broker.subscribe(PUSH_BROADCAST_TOPIC).await.unwrap();

    // Client 99 is unknown everywhere: the push must broadcast and
    // still report success.
    state.fanout.push_config(99, "{}".into()).await.unwrap();

    let message = tokio::time::timeout(Duration::from_secs(1), watcher.recv())
        .await
        .expect("broadcast not observed")
        .unwrap();
    let envelope: FanoutEnvelope = serde_json::from_slice(&message.payload).unwrap();
    assert_eq!(envelope.client_id, 99);
    assert_eq!(envelope.command.command_type, CommandType::ConfigSet);
}

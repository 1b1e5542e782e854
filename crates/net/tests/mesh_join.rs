use std::sync::atomic::{AtomicU16, Ordering};
use std::thread;
use std::time::Duration;

use lanmesh::{Address, Mesh, Node, NodeState, SlotState};

static PORT_COUNTER: AtomicU16 = AtomicU16::new(44000);

fn next_port() -> u16 {
    PORT_COUNTER.fetch_add(10, Ordering::SeqCst)
}

const PROTO: u32 = 0x11223344;
const STEP: f32 = 0.05;
const SEND_RATE: f32 = 0.05;
const TIMEOUT: f32 = 1.0;

fn pump(mesh: &mut Mesh, nodes: &mut [&mut Node], mut done: impl FnMut(&Mesh, &[&mut Node]) -> bool) {
    for _ in 0..600 {
        mesh.update(STEP);
        for node in nodes.iter_mut() {
            node.update(STEP);
        }
        if done(mesh, nodes) {
            return;
        }
        thread::sleep(Duration::from_millis(2));
    }
    panic!("condition never reached");
}

#[test]
fn test_join_lifecycle_with_four_slots() {
    let mesh_port = next_port();
    let mut mesh = Mesh::with_rates(PROTO, 4, SEND_RATE, TIMEOUT);
    mesh.start(mesh_port).unwrap();

    let mut node = Node::with_rates(PROTO, SEND_RATE, TIMEOUT);
    node.start(0).unwrap();
    node.join(Address::new(127, 0, 0, 1, mesh_port));
    assert!(node.is_joining());

    pump(&mut mesh, &mut [&mut node], |mesh, nodes| {
        mesh.is_node_connected(0) && nodes[0].is_connected()
    });

    assert_eq!(node.state(), NodeState::Joined);
    assert_eq!(node.local_node_id(), Some(0));
    assert_eq!(node.max_nodes(), 4);
    assert_eq!(mesh.node_state(0), Some(SlotState::Connected));

    // Withhold all node traffic: the slot resets and its address leaves
    // the index.
    let occupied = mesh.node_address(0);
    assert!(occupied.is_some());
    for _ in 0..40 {
        mesh.update(STEP);
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(mesh.node_state(0), Some(SlotState::Disconnected));
    assert_eq!(mesh.node_address(0), None);
}

#[test]
fn test_node_sees_peer_membership_and_exchanges_payloads() {
    let mesh_port = next_port();
    let mut mesh = Mesh::with_rates(PROTO, 4, SEND_RATE, TIMEOUT);
    mesh.start(mesh_port).unwrap();
    let mesh_addr = Address::new(127, 0, 0, 1, mesh_port);

    let mut first = Node::with_rates(PROTO, SEND_RATE, TIMEOUT);
    let mut second = Node::with_rates(PROTO, SEND_RATE, TIMEOUT);
    first.start(0).unwrap();
    second.start(0).unwrap();
    first.join(mesh_addr);
    second.join(mesh_addr);

    pump(&mut mesh, &mut [&mut first, &mut second], |_, nodes| {
        nodes[0].is_node_connected(1) && nodes[1].is_node_connected(0)
    });

    assert_eq!(first.local_node_id(), Some(0));
    assert_eq!(second.local_node_id(), Some(1));

    assert!(first.send_packet(1, b"from zero"));
    assert!(second.send_packet(0, b"from one"));

    let mut got_first = None;
    let mut got_second = None;
    for _ in 0..200 {
        mesh.update(STEP);
        first.update(STEP);
        second.update(STEP);
        if got_second.is_none() {
            got_second = second.receive_packet();
        }
        if got_first.is_none() {
            got_first = first.receive_packet();
        }
        if got_first.is_some() && got_second.is_some() {
            break;
        }
        thread::sleep(Duration::from_millis(2));
    }

    assert_eq!(got_second, Some((0, b"from zero".to_vec())));
    assert_eq!(got_first, Some((1, b"from one".to_vec())));
}

#[test]
fn test_join_to_silent_port_fails() {
    let mut node = Node::with_rates(PROTO, SEND_RATE, 0.3);
    node.start(0).unwrap();
    // Nothing listens on port 9; the join must fail on its own timeout.
    node.join(Address::new(127, 0, 0, 1, 9));

    for _ in 0..20 {
        node.update(STEP);
        if node.join_failed() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(node.state(), NodeState::JoinFail);
}

#[test]
fn test_mesh_slot_ids_are_stable_across_peer_churn() {
    let mesh_port = next_port();
    let mut mesh = Mesh::with_rates(PROTO, 4, SEND_RATE, TIMEOUT);
    mesh.start(mesh_port).unwrap();
    let mesh_addr = Address::new(127, 0, 0, 1, mesh_port);

    let mut first = Node::with_rates(PROTO, SEND_RATE, TIMEOUT);
    let mut second = Node::with_rates(PROTO, SEND_RATE, TIMEOUT);
    first.start(0).unwrap();
    second.start(0).unwrap();
    first.join(mesh_addr);
    second.join(mesh_addr);

    pump(&mut mesh, &mut [&mut first, &mut second], |mesh, _| {
        mesh.is_node_connected(0) && mesh.is_node_connected(1)
    });

    // Drop the first node; slot 0 frees up while slot 1 keeps its id.
    first.stop();
    pump(&mut mesh, &mut [&mut second], |mesh, nodes| {
        mesh.node_state(0) == Some(SlotState::Disconnected) && !nodes[0].is_node_connected(0)
    });
    assert!(mesh.is_node_connected(1));
    assert_eq!(second.local_node_id(), Some(1));
    assert!(!second.is_node_connected(0));
}

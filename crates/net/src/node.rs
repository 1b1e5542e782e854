//! Node-side mesh participant: joins a mesh, mirrors its membership table,
//! and exchanges payloads with any other node by logical index.

use std::collections::{HashMap, VecDeque};
use std::io;

use crate::address::Address;
use crate::socket::Socket;
use crate::wire::{self, MeshCommand, MeshMessage};

const RECV_BUFFER_SIZE: usize = 2048;
/// Inbound payloads buffered between updates; beyond this the oldest are
/// dropped.
const MAX_BUFFERED_PACKETS: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeState {
    Disconnected,
    Joining,
    Joined,
    JoinFail,
}

#[derive(Debug, Clone, Copy, Default)]
struct Entry {
    connected: bool,
    address: Address,
}

#[derive(Debug)]
pub struct Node {
    protocol_id: u32,
    send_rate: f32,
    timeout: f32,
    socket: Option<Socket>,
    state: NodeState,
    mesh_address: Address,
    local_node_id: Option<usize>,
    entries: Vec<Entry>,
    node_by_addr: HashMap<Address, usize>,
    send_accumulator: f32,
    timeout_accumulator: f32,
    received: VecDeque<(usize, Vec<u8>)>,
}

impl Node {
    pub fn new(protocol_id: u32) -> Self {
        Self::with_rates(protocol_id, 0.25, 10.0)
    }

    pub fn with_rates(protocol_id: u32, send_rate: f32, timeout: f32) -> Self {
        Self {
            protocol_id,
            send_rate,
            timeout,
            socket: None,
            state: NodeState::Disconnected,
            mesh_address: Address::ZERO,
            local_node_id: None,
            entries: Vec::new(),
            node_by_addr: HashMap::new(),
            send_accumulator: 0.0,
            timeout_accumulator: 0.0,
            received: VecDeque::new(),
        }
    }

    pub fn start(&mut self, port: u16) -> io::Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "node already started",
            ));
        }
        let socket = Socket::open(port, false)?;
        log::info!("node started on port {}", socket.local_port());
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            log::info!("node stopped");
        }
        self.clear_data();
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.local_port())
    }

    /// Begins joining the mesh at `address`. Join requests go out at the
    /// configured send rate until the mesh answers or the timeout fires.
    pub fn join(&mut self, address: Address) {
        log::info!("node joining mesh at {}", address);
        self.clear_data();
        self.state = NodeState::Joining;
        self.mesh_address = address;
    }

    pub fn state(&self) -> NodeState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == NodeState::Joined
    }

    pub fn is_joining(&self) -> bool {
        self.state == NodeState::Joining
    }

    pub fn join_failed(&self) -> bool {
        self.state == NodeState::JoinFail
    }

    pub fn local_node_id(&self) -> Option<usize> {
        self.local_node_id
    }

    /// Size of the membership table, known once the mesh accepts us.
    pub fn max_nodes(&self) -> usize {
        self.entries.len()
    }

    pub fn is_node_connected(&self, node_id: usize) -> bool {
        self.entries.get(node_id).is_some_and(|e| e.connected)
    }

    pub fn node_address(&self, node_id: usize) -> Option<Address> {
        self.entries
            .get(node_id)
            .filter(|e| e.connected)
            .map(|e| e.address)
    }

    pub fn node_id_from_address(&self, address: Address) -> Option<usize> {
        self.node_by_addr.get(&address).copied()
    }

    pub fn update(&mut self, dt: f32) {
        self.receive_packets();
        self.send_packets(dt);
        self.check_timeout(dt);
    }

    /// Sends `payload` directly to the node in slot `node_id`.
    pub fn send_packet(&self, node_id: usize, payload: &[u8]) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        if self.state != NodeState::Joined {
            return false;
        }
        let Some(entry) = self.entries.get(node_id).filter(|e| e.connected) else {
            return false;
        };
        let mut datagram = Vec::with_capacity(wire::PROTOCOL_HEADER_SIZE + payload.len());
        wire::write_protocol_header(&mut datagram, self.protocol_id);
        datagram.extend_from_slice(payload);
        match socket.send(entry.address, &datagram) {
            Ok(()) => true,
            Err(e) => {
                log::warn!("node send to {} failed: {}", entry.address, e);
                false
            }
        }
    }

    /// Pops the next buffered payload as `(sender node id, bytes)`.
    pub fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        self.received.pop_front()
    }

    fn receive_packets(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let Some(socket) = &self.socket else { return };
            let (from, size) = match socket.receive(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    log::warn!("node receive failed: {}", e);
                    return;
                }
            };
            if from == self.mesh_address && !self.mesh_address.is_zero() {
                match MeshMessage::decode(self.protocol_id, &buf[..size]) {
                    Ok(message) => self.process_mesh_message(message),
                    Err(e) => log::trace!("dropping mesh datagram: {}", e),
                }
            } else {
                self.process_payload(from, &buf[..size]);
            }
        }
    }

    fn process_mesh_message(&mut self, message: MeshMessage) {
        match message {
            MeshMessage::ConnectionAccept {
                node_id,
                total_nodes,
            } => {
                if self.state == NodeState::Joining {
                    log::info!(
                        "node joined mesh as {} of {} nodes",
                        node_id,
                        total_nodes
                    );
                    self.state = NodeState::Joined;
                    self.local_node_id = Some(node_id as usize);
                    self.entries = vec![Entry::default(); total_nodes as usize];
                }
                self.timeout_accumulator = 0.0;
            }
            MeshMessage::Update { slots } => {
                if self.state != NodeState::Joined || slots.len() != self.entries.len() {
                    return;
                }
                for (node_id, address) in slots.into_iter().enumerate() {
                    self.apply_slot(node_id, address);
                }
                self.timeout_accumulator = 0.0;
            }
        }
    }

    fn apply_slot(&mut self, node_id: usize, address: Address) {
        let entry = &mut self.entries[node_id];
        if entry.address == address {
            return;
        }
        if entry.connected {
            log::info!("node {} disconnected from mesh view", node_id);
            self.node_by_addr.remove(&entry.address);
        }
        if address.is_zero() {
            *entry = Entry::default();
        } else {
            log::info!("node {} connected at {}", node_id, address);
            entry.connected = true;
            entry.address = address;
            self.node_by_addr.insert(address, node_id);
        }
    }

    fn process_payload(&mut self, from: Address, data: &[u8]) {
        let Ok(payload) = wire::strip_protocol_header(self.protocol_id, data) else {
            return;
        };
        let Some(&node_id) = self.node_by_addr.get(&from) else {
            log::trace!("payload from unknown address {}", from);
            return;
        };
        if self.received.len() >= MAX_BUFFERED_PACKETS {
            self.received.pop_front();
        }
        self.received.push_back((node_id, payload.to_vec()));
    }

    fn send_packets(&mut self, dt: f32) {
        let Some(socket) = &self.socket else { return };
        let command = match self.state {
            NodeState::Joining => MeshCommand::JoinRequest,
            NodeState::Joined => MeshCommand::KeepAlive,
            _ => return,
        };
        self.send_accumulator += dt;
        while self.send_accumulator > self.send_rate {
            if let Err(e) = socket.send(self.mesh_address, &command.encode(self.protocol_id)) {
                log::warn!("node send to mesh failed: {}", e);
            }
            self.send_accumulator -= self.send_rate;
        }
    }

    fn check_timeout(&mut self, dt: f32) {
        if !matches!(self.state, NodeState::Joining | NodeState::Joined) {
            return;
        }
        self.timeout_accumulator += dt;
        if self.timeout_accumulator > self.timeout {
            let failed = self.state == NodeState::Joining;
            log::warn!(
                "node timed out while {:?}",
                self.state
            );
            self.clear_data();
            self.state = if failed {
                NodeState::JoinFail
            } else {
                NodeState::Disconnected
            };
        }
    }

    fn clear_data(&mut self) {
        self.state = NodeState::Disconnected;
        self.mesh_address = Address::ZERO;
        self.local_node_id = None;
        self.entries.clear();
        self.node_by_addr.clear();
        self.send_accumulator = 0.0;
        self.timeout_accumulator = 0.0;
        self.received.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO: u32 = 0x4C4D5348;

    fn joined_node() -> Node {
        let mut node = Node::new(PROTO);
        node.join(Address::new(127, 0, 0, 1, 30000));
        node.state = NodeState::Joining;
        node.mesh_address = Address::new(127, 0, 0, 1, 30000);
        node.process_mesh_message(MeshMessage::ConnectionAccept {
            node_id: 1,
            total_nodes: 4,
        });
        node
    }

    #[test]
    fn test_accept_sets_id_and_table_size() {
        let node = joined_node();
        assert_eq!(node.state(), NodeState::Joined);
        assert_eq!(node.local_node_id(), Some(1));
        assert_eq!(node.max_nodes(), 4);
        assert!(!node.is_node_connected(0));
    }

    #[test]
    fn test_update_diffs_membership() {
        let mut node = joined_node();
        let peer = Address::new(10, 0, 0, 2, 31000);
        node.process_mesh_message(MeshMessage::Update {
            slots: vec![Address::ZERO, Address::new(10, 0, 0, 1, 31000), peer, Address::ZERO],
        });
        assert!(node.is_node_connected(2));
        assert_eq!(node.node_address(2), Some(peer));
        assert_eq!(node.node_id_from_address(peer), Some(2));

        // Peer vanishes from the next update.
        node.process_mesh_message(MeshMessage::Update {
            slots: vec![
                Address::ZERO,
                Address::new(10, 0, 0, 1, 31000),
                Address::ZERO,
                Address::ZERO,
            ],
        });
        assert!(!node.is_node_connected(2));
        assert_eq!(node.node_id_from_address(peer), None);
    }

    #[test]
    fn test_update_with_wrong_slot_count_dropped() {
        let mut node = joined_node();
        node.process_mesh_message(MeshMessage::Update {
            slots: vec![Address::new(10, 0, 0, 1, 31000)],
        });
        assert!(!node.is_node_connected(0));
    }

    #[test]
    fn test_payload_from_known_peer_is_buffered() {
        let mut node = joined_node();
        let peer = Address::new(10, 0, 0, 2, 31000);
        node.process_mesh_message(MeshMessage::Update {
            slots: vec![Address::ZERO, Address::ZERO, peer, Address::ZERO],
        });

        let mut datagram = Vec::new();
        wire::write_protocol_header(&mut datagram, PROTO);
        datagram.extend_from_slice(b"payload");
        node.process_payload(peer, &datagram);

        assert_eq!(node.receive_packet(), Some((2, b"payload".to_vec())));
        assert_eq!(node.receive_packet(), None);
    }

    #[test]
    fn test_payload_from_stranger_is_dropped() {
        let mut node = joined_node();
        let mut datagram = Vec::new();
        wire::write_protocol_header(&mut datagram, PROTO);
        datagram.extend_from_slice(b"payload");
        node.process_payload(Address::new(9, 9, 9, 9, 9), &datagram);
        assert_eq!(node.receive_packet(), None);
    }

    #[test]
    fn test_join_timeout_becomes_join_fail() {
        let mut node = Node::with_rates(PROTO, 0.25, 1.0);
        node.join(Address::new(127, 0, 0, 1, 30000));
        node.check_timeout(1.5);
        assert_eq!(node.state(), NodeState::JoinFail);
        assert!(node.join_failed());
    }

    #[test]
    fn test_joined_timeout_becomes_disconnected() {
        let mut node = joined_node();
        node.check_timeout(10.5);
        assert_eq!(node.state(), NodeState::Disconnected);
        assert_eq!(node.local_node_id(), None);
        assert_eq!(node.max_nodes(), 0);
    }
}

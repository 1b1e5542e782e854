//! Server-side mesh authority: a fixed table of node slots filled by join
//! requests and kept alive by keep-alives, with the full membership
//! broadcast to every connected node at the configured send rate.

use std::collections::HashMap;
use std::io;

use crate::address::Address;
use crate::socket::Socket;
use crate::wire::{MeshCommand, MeshMessage};

const RECV_BUFFER_SIZE: usize = 64;

/// State of one mesh slot. Slots are reset in place on timeout, never
/// reallocated, so a node id stays valid for the whole occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotState {
    Disconnected,
    ConnectionAccept,
    Connected,
}

#[derive(Debug, Clone, Copy)]
struct Slot {
    state: SlotState,
    address: Address,
    timeout_accumulator: f32,
}

impl Slot {
    const VACANT: Slot = Slot {
        state: SlotState::Disconnected,
        address: Address::ZERO,
        timeout_accumulator: 0.0,
    };
}

#[derive(Debug)]
pub struct Mesh {
    protocol_id: u32,
    send_rate: f32,
    timeout: f32,
    socket: Option<Socket>,
    slots: Vec<Slot>,
    slot_by_addr: HashMap<Address, usize>,
    send_accumulator: f32,
}

impl Mesh {
    pub fn new(protocol_id: u32, max_nodes: usize) -> Self {
        Self::with_rates(protocol_id, max_nodes, 0.25, 10.0)
    }

    pub fn with_rates(protocol_id: u32, max_nodes: usize, send_rate: f32, timeout: f32) -> Self {
        assert!(max_nodes >= 1 && max_nodes <= u8::MAX as usize);
        Self {
            protocol_id,
            send_rate,
            timeout,
            socket: None,
            slots: vec![Slot::VACANT; max_nodes],
            slot_by_addr: HashMap::new(),
            send_accumulator: 0.0,
        }
    }

    pub fn start(&mut self, port: u16) -> io::Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "mesh already started",
            ));
        }
        let socket = Socket::open(port, false)?;
        log::info!("mesh started on port {}", socket.local_port());
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            log::info!("mesh stopped");
        }
        for slot in &mut self.slots {
            *slot = Slot::VACANT;
        }
        self.slot_by_addr.clear();
        self.send_accumulator = 0.0;
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.local_port())
    }

    pub fn max_nodes(&self) -> usize {
        self.slots.len()
    }

    pub fn node_state(&self, node_id: usize) -> Option<SlotState> {
        self.slots.get(node_id).map(|s| s.state)
    }

    pub fn is_node_connected(&self, node_id: usize) -> bool {
        self.node_state(node_id) == Some(SlotState::Connected)
    }

    pub fn node_address(&self, node_id: usize) -> Option<Address> {
        self.slots
            .get(node_id)
            .filter(|s| s.state != SlotState::Disconnected)
            .map(|s| s.address)
    }

    pub fn connected_count(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| s.state == SlotState::Connected)
            .count()
    }

    /// Pre-binds a slot to an address, as for the server's own loopback
    /// node. The slot still has to keep-alive its way to `Connected`.
    pub fn reserve(&mut self, node_id: usize, address: Address) {
        debug_assert_eq!(self.slots[node_id].state, SlotState::Disconnected);
        log::info!("mesh reserving node {} for {}", node_id, address);
        self.slots[node_id] = Slot {
            state: SlotState::ConnectionAccept,
            address,
            timeout_accumulator: 0.0,
        };
        self.slot_by_addr.insert(address, node_id);
    }

    pub fn update(&mut self, dt: f32) {
        self.receive_packets();
        self.send_packets(dt);
        self.check_timeouts(dt);
    }

    fn receive_packets(&mut self) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        loop {
            let Some(socket) = &self.socket else { return };
            let (from, size) = match socket.receive(&mut buf) {
                Ok(Some(received)) => received,
                Ok(None) => return,
                Err(e) => {
                    log::warn!("mesh receive failed: {}", e);
                    return;
                }
            };
            match MeshCommand::decode(self.protocol_id, &buf[..size]) {
                Ok(command) => self.process_command(from, command),
                Err(e) => log::trace!("dropping datagram from {}: {}", from, e),
            }
        }
    }

    fn process_command(&mut self, from: Address, command: MeshCommand) {
        match command {
            MeshCommand::JoinRequest => {
                if let Some(&node_id) = self.slot_by_addr.get(&from) {
                    // Repeated join requests keep the slot alive.
                    self.slots[node_id].timeout_accumulator = 0.0;
                    return;
                }
                match self
                    .slots
                    .iter()
                    .position(|s| s.state == SlotState::Disconnected)
                {
                    Some(node_id) => {
                        log::info!("mesh accepting node {} from {}", node_id, from);
                        self.slots[node_id] = Slot {
                            state: SlotState::ConnectionAccept,
                            address: from,
                            timeout_accumulator: 0.0,
                        };
                        self.slot_by_addr.insert(from, node_id);
                    }
                    // No free slot: the request goes unanswered and the
                    // client times out on its own.
                    None => log::debug!("mesh full, ignoring join request from {}", from),
                }
            }
            MeshCommand::KeepAlive => {
                if let Some(&node_id) = self.slot_by_addr.get(&from) {
                    let slot = &mut self.slots[node_id];
                    slot.timeout_accumulator = 0.0;
                    if slot.state == SlotState::ConnectionAccept {
                        log::info!("mesh node {} connected", node_id);
                        slot.state = SlotState::Connected;
                    }
                }
            }
        }
    }

    fn send_packets(&mut self, dt: f32) {
        let Some(socket) = &self.socket else { return };
        self.send_accumulator += dt;
        while self.send_accumulator > self.send_rate {
            let total_nodes = self.slots.len() as u8;
            let membership: Vec<Address> = self.slots.iter().map(|s| s.address).collect();
            for (node_id, slot) in self.slots.iter().enumerate() {
                let message = match slot.state {
                    SlotState::Disconnected => continue,
                    SlotState::ConnectionAccept => MeshMessage::ConnectionAccept {
                        node_id: node_id as u8,
                        total_nodes,
                    },
                    SlotState::Connected => MeshMessage::Update {
                        slots: membership.clone(),
                    },
                };
                if let Err(e) = socket.send(slot.address, &message.encode(self.protocol_id)) {
                    log::warn!("mesh send to {} failed: {}", slot.address, e);
                }
            }
            self.send_accumulator -= self.send_rate;
        }
    }

    fn check_timeouts(&mut self, dt: f32) {
        for (node_id, slot) in self.slots.iter_mut().enumerate() {
            if slot.state == SlotState::Disconnected {
                continue;
            }
            slot.timeout_accumulator += dt;
            if slot.timeout_accumulator > self.timeout {
                log::info!("mesh node {} at {} timed out", node_id, slot.address);
                self.slot_by_addr.remove(&slot.address);
                *slot = Slot::VACANT;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROTO: u32 = 0x4C4D5348;

    #[test]
    fn test_slot_table_is_fixed_capacity() {
        let mesh = Mesh::new(PROTO, 4);
        assert_eq!(mesh.max_nodes(), 4);
        assert_eq!(mesh.connected_count(), 0);
        assert_eq!(mesh.node_state(3), Some(SlotState::Disconnected));
        assert_eq!(mesh.node_state(4), None);
    }

    #[test]
    fn test_join_keepalive_timeout_lifecycle() {
        let mut mesh = Mesh::with_rates(PROTO, 4, 0.25, 1.0);
        let joiner = Address::new(127, 0, 0, 1, 40001);

        mesh.process_command(joiner, MeshCommand::JoinRequest);
        assert_eq!(mesh.node_state(0), Some(SlotState::ConnectionAccept));
        assert_eq!(mesh.node_address(0), Some(joiner));

        mesh.process_command(joiner, MeshCommand::KeepAlive);
        assert_eq!(mesh.node_state(0), Some(SlotState::Connected));
        assert_eq!(mesh.connected_count(), 1);

        // Silence beyond the timeout resets the slot and the address index.
        mesh.check_timeouts(1.2);
        assert_eq!(mesh.node_state(0), Some(SlotState::Disconnected));
        assert_eq!(mesh.node_address(0), None);
        assert!(mesh.slot_by_addr.is_empty());
    }

    #[test]
    fn test_repeat_join_request_does_not_take_second_slot() {
        let mut mesh = Mesh::new(PROTO, 4);
        let joiner = Address::new(10, 0, 0, 1, 5000);
        mesh.process_command(joiner, MeshCommand::JoinRequest);
        mesh.process_command(joiner, MeshCommand::JoinRequest);
        assert_eq!(mesh.node_state(0), Some(SlotState::ConnectionAccept));
        assert_eq!(mesh.node_state(1), Some(SlotState::Disconnected));
    }

    #[test]
    fn test_full_mesh_ignores_join() {
        let mut mesh = Mesh::new(PROTO, 2);
        mesh.process_command(Address::new(10, 0, 0, 1, 1), MeshCommand::JoinRequest);
        mesh.process_command(Address::new(10, 0, 0, 2, 1), MeshCommand::JoinRequest);
        mesh.process_command(Address::new(10, 0, 0, 3, 1), MeshCommand::JoinRequest);
        assert!(mesh.slot_by_addr.len() == 2);
    }

    #[test]
    fn test_keepalive_from_stranger_ignored() {
        let mut mesh = Mesh::new(PROTO, 2);
        mesh.process_command(Address::new(10, 0, 0, 9, 1), MeshCommand::KeepAlive);
        assert_eq!(mesh.connected_count(), 0);
        assert!(mesh.slot_by_addr.is_empty());
    }

    #[test]
    fn test_slot_reused_after_timeout() {
        let mut mesh = Mesh::with_rates(PROTO, 2, 0.25, 1.0);
        let first = Address::new(10, 0, 0, 1, 1);
        let second = Address::new(10, 0, 0, 2, 1);

        mesh.process_command(first, MeshCommand::JoinRequest);
        mesh.check_timeouts(1.5);
        mesh.process_command(second, MeshCommand::JoinRequest);

        assert_eq!(mesh.node_address(0), Some(second));
    }
}

//! Point-to-point virtual connection over a `Socket`.
//!
//! One `Connection` talks to exactly one peer. The listening side latches
//! the first valid sender as its remote endpoint. Reliability tracking is a
//! component selected at construction rather than a subclass: a reliable
//! connection is the same state machine with a 12-byte reliability header
//! spliced in after the protocol magic.

use std::collections::VecDeque;
use std::io;

use crate::address::Address;
use crate::flow::FlowControl;
use crate::reliability::ReliabilitySystem;
use crate::socket::Socket;
use crate::wire::{self, ReliableHeader, PROTOCOL_HEADER_SIZE, RELIABLE_HEADER_SIZE};

const RECV_BUFFER_SIZE: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Listening,
    Connecting,
    ConnectFail,
    Connected,
}

/// Lifecycle notifications, drained by the caller after each `update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEvent {
    Started,
    Stopped,
    Connected,
    Disconnected,
}

#[derive(Debug)]
pub struct Connection {
    protocol_id: u32,
    timeout: f32,
    socket: Option<Socket>,
    state: ConnectionState,
    remote: Address,
    timeout_accumulator: f32,
    reliability: Option<ReliabilitySystem>,
    flow: Option<FlowControl>,
    events: VecDeque<ConnectionEvent>,
}

impl Connection {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            protocol_id,
            timeout,
            socket: None,
            state: ConnectionState::Disconnected,
            remote: Address::ZERO,
            timeout_accumulator: 0.0,
            reliability: None,
            flow: None,
            events: VecDeque::new(),
        }
    }

    /// A connection that carries the reliability header and feeds a
    /// `ReliabilitySystem` on every send and receive. The RTT estimate in
    /// turn drives a `FlowControl` governor exposed through `send_rate`.
    pub fn reliable(protocol_id: u32, timeout: f32, max_sequence: u32) -> Self {
        let mut connection = Self::new(protocol_id, timeout);
        connection.reliability = Some(ReliabilitySystem::new(max_sequence));
        connection.flow = Some(FlowControl::default());
        connection
    }

    pub fn start(&mut self, port: u16) -> io::Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "connection already started",
            ));
        }
        let socket = Socket::open(port, false)?;
        log::debug!("connection started on port {}", socket.local_port());
        self.socket = Some(socket);
        self.events.push_back(ConnectionEvent::Started);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.is_none() {
            return;
        }
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.events.push_back(ConnectionEvent::Disconnected);
        }
        self.clear_data();
        self.state = ConnectionState::Disconnected;
        self.socket = None;
        self.events.push_back(ConnectionEvent::Stopped);
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn local_port(&self) -> Option<u16> {
        self.socket.as_ref().map(|s| s.local_port())
    }

    pub fn listen(&mut self) {
        log::debug!("connection listening");
        self.disconnect_if_active();
        self.clear_data();
        self.state = ConnectionState::Listening;
    }

    pub fn connect(&mut self, address: Address) {
        log::debug!("connecting to {}", address);
        self.disconnect_if_active();
        self.clear_data();
        self.state = ConnectionState::Connecting;
        self.remote = address;
    }

    fn disconnect_if_active(&mut self) {
        if matches!(
            self.state,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            self.events.push_back(ConnectionEvent::Disconnected);
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_connected(&self) -> bool {
        self.state == ConnectionState::Connected
    }

    pub fn connect_failed(&self) -> bool {
        self.state == ConnectionState::ConnectFail
    }

    pub fn remote_address(&self) -> Address {
        self.remote
    }

    pub fn reliability(&self) -> Option<&ReliabilitySystem> {
        self.reliability.as_ref()
    }

    pub fn flow(&self) -> Option<&FlowControl> {
        self.flow.as_ref()
    }

    /// Packets-per-second budget from the flow governor, on reliable
    /// connections only.
    pub fn send_rate(&self) -> Option<f32> {
        self.flow.as_ref().map(|f| f.send_rate())
    }

    /// Bytes of header prefixed to every payload on this connection.
    pub fn header_size(&self) -> usize {
        PROTOCOL_HEADER_SIZE
            + if self.reliability.is_some() {
                RELIABLE_HEADER_SIZE
            } else {
                0
            }
    }

    pub fn update(&mut self, dt: f32) {
        self.timeout_accumulator += dt;
        if self.timeout_accumulator > self.timeout
            && matches!(
                self.state,
                ConnectionState::Connecting | ConnectionState::Connected
            )
        {
            let was_connecting = self.state == ConnectionState::Connecting;
            log::warn!(
                "connection to {} timed out while {:?}",
                self.remote,
                self.state
            );
            self.clear_data();
            self.state = if was_connecting {
                ConnectionState::ConnectFail
            } else {
                ConnectionState::Disconnected
            };
            self.events.push_back(ConnectionEvent::Disconnected);
        }
        if let Some(reliability) = &mut self.reliability {
            reliability.update(dt);
            if let Some(flow) = &mut self.flow {
                flow.update(dt, reliability.rtt());
            }
        }
    }

    pub fn poll_events(&mut self) -> impl Iterator<Item = ConnectionEvent> + '_ {
        self.events.drain(..)
    }

    /// Sends `payload` to the remote peer with the protocol (and, when
    /// enabled, reliability) header prefixed. Returns false when the
    /// connection has no peer yet or the socket refuses the datagram.
    pub fn send_packet(&mut self, payload: &[u8]) -> bool {
        let Some(socket) = &self.socket else {
            return false;
        };
        if self.remote.is_zero() {
            return false;
        }

        let mut datagram = Vec::with_capacity(self.header_size() + payload.len());
        wire::write_protocol_header(&mut datagram, self.protocol_id);
        if let Some(reliability) = &self.reliability {
            ReliableHeader {
                sequence: reliability.local_sequence(),
                ack: reliability.remote_sequence(),
                ack_bits: reliability.generate_ack_bits(),
            }
            .encode(&mut datagram);
        }
        datagram.extend_from_slice(payload);

        if let Err(e) = socket.send(self.remote, &datagram) {
            log::warn!("send to {} failed: {}", self.remote, e);
            return false;
        }
        if let Some(reliability) = &mut self.reliability {
            reliability.packet_sent(payload.len());
        }
        true
    }

    /// Returns the next valid payload, or `None` once the socket is
    /// drained. Datagrams with the wrong magic, a truncated header, or from
    /// an unexpected sender are dropped silently.
    pub fn receive_packet(&mut self, buf: &mut [u8]) -> Option<usize> {
        let mut datagram = [0u8; RECV_BUFFER_SIZE];
        loop {
            let socket = self.socket.as_ref()?;
            let (from, size) = match socket.receive(&mut datagram) {
                Ok(Some(received)) => received,
                Ok(None) => return None,
                Err(e) => {
                    log::warn!("receive failed: {}", e);
                    return None;
                }
            };

            let body = match wire::strip_protocol_header(self.protocol_id, &datagram[..size]) {
                Ok(body) => body,
                Err(_) => continue,
            };

            match self.state {
                ConnectionState::Listening => {
                    log::info!("connection accepted from {}", from);
                    self.state = ConnectionState::Connected;
                    self.remote = from;
                    self.events.push_back(ConnectionEvent::Connected);
                }
                ConnectionState::Connecting if from == self.remote => {
                    log::info!("connection to {} completed", self.remote);
                    self.state = ConnectionState::Connected;
                    self.events.push_back(ConnectionEvent::Connected);
                }
                ConnectionState::Connected if from == self.remote => {}
                _ => continue,
            }

            let payload = match &mut self.reliability {
                Some(reliability) => {
                    let (header, payload) = match ReliableHeader::decode(body) {
                        Ok(decoded) => decoded,
                        Err(_) => continue,
                    };
                    reliability.packet_received(header.sequence, payload.len());
                    reliability.process_ack(header.ack, header.ack_bits);
                    payload
                }
                None => body,
            };

            if payload.len() > buf.len() {
                log::warn!("payload of {} bytes exceeds caller buffer", payload.len());
                continue;
            }
            self.timeout_accumulator = 0.0;
            buf[..payload.len()].copy_from_slice(payload);
            return Some(payload.len());
        }
    }

    fn clear_data(&mut self) {
        self.remote = Address::ZERO;
        self.timeout_accumulator = 0.0;
        if let Some(reliability) = &mut self.reliability {
            reliability.reset();
        }
        if let Some(flow) = &mut self.flow {
            flow.reset();
        }
    }
}

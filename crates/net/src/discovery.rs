//! LAN discovery pair: a `Beacon` broadcasting a name + port advertisement
//! once per second, and a `Listener` collecting advertisements into a
//! timeout-pruned table the application can browse.

use std::io;

use crate::address::Address;
use crate::socket::Socket;
use crate::wire::{Advertisement, MAX_SERVER_NAME_LENGTH};

const RECV_BUFFER_SIZE: usize = 256;
const BROADCAST_INTERVAL: f32 = 1.0;

/// Broadcasts a server advertisement to the listener port once per second.
#[derive(Debug)]
pub struct Beacon {
    advertisement: Vec<u8>,
    listener_port: u16,
    socket: Option<Socket>,
    accumulator: f32,
}

impl Beacon {
    pub fn new(name: &str, protocol_id: u32, listener_port: u16, server_port: u16) -> Self {
        let mut name = name.to_owned();
        if name.len() > MAX_SERVER_NAME_LENGTH {
            log::warn!("beacon name truncated to {} bytes", MAX_SERVER_NAME_LENGTH);
            while name.len() > MAX_SERVER_NAME_LENGTH {
                name.pop();
            }
        }
        let advertisement = Advertisement {
            protocol_id,
            server_port,
            name,
        }
        .encode();
        Self {
            advertisement,
            listener_port,
            socket: None,
            accumulator: 0.0,
        }
    }

    pub fn start(&mut self, port: u16) -> io::Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "beacon already started",
            ));
        }
        let socket = Socket::open(port, true)?;
        log::info!("beacon started on port {}", socket.local_port());
        self.socket = Some(socket);
        self.accumulator = 0.0;
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            log::info!("beacon stopped");
        }
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn update(&mut self, dt: f32) {
        let Some(socket) = &self.socket else { return };
        self.accumulator += dt;
        while self.accumulator >= BROADCAST_INTERVAL {
            let broadcast = Address::new(255, 255, 255, 255, self.listener_port);
            if let Err(e) = socket.send(broadcast, &self.advertisement) {
                log::warn!("beacon broadcast failed: {}", e);
            }
            self.accumulator -= BROADCAST_INTERVAL;
        }
        // No reply protocol exists; drain and discard anything inbound.
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        while let Ok(Some(_)) = socket.receive(&mut buf) {}
    }
}

/// One discovered server advertisement. The address is the advertiser's IP
/// with the advertised game port.
#[derive(Debug, Clone, PartialEq)]
pub struct ListenerEntry {
    pub name: String,
    pub address: Address,
    timeout_accumulator: f32,
}

/// Collects beacon advertisements into a browseable table, pruning entries
/// that stop being refreshed.
#[derive(Debug)]
pub struct Listener {
    protocol_id: u32,
    timeout: f32,
    socket: Option<Socket>,
    entries: Vec<ListenerEntry>,
}

impl Listener {
    pub fn new(protocol_id: u32, timeout: f32) -> Self {
        Self {
            protocol_id,
            timeout,
            socket: None,
            entries: Vec::new(),
        }
    }

    pub fn start(&mut self, port: u16) -> io::Result<()> {
        if self.socket.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "listener already started",
            ));
        }
        let socket = Socket::open(port, false)?;
        log::info!("listener started on port {}", socket.local_port());
        self.socket = Some(socket);
        Ok(())
    }

    pub fn stop(&mut self) {
        if self.socket.take().is_some() {
            log::info!("listener stopped");
        }
        self.entries.clear();
    }

    pub fn is_running(&self) -> bool {
        self.socket.is_some()
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }

    pub fn entry(&self, index: usize) -> Option<&ListenerEntry> {
        self.entries.get(index)
    }

    pub fn find_by_name(&self, name: &str) -> Option<&ListenerEntry> {
        self.entries.iter().find(|e| e.name == name)
    }

    pub fn update(&mut self, dt: f32) {
        let mut buf = [0u8; RECV_BUFFER_SIZE];
        while let Some(socket) = &self.socket {
            match socket.receive(&mut buf) {
                Ok(Some((from, size))) => {
                    let data = buf[..size].to_vec();
                    self.process_packet(from, &data);
                }
                Ok(None) => break,
                Err(e) => {
                    log::warn!("listener receive failed: {}", e);
                    break;
                }
            }
        }

        for entry in &mut self.entries {
            entry.timeout_accumulator += dt;
        }
        let timeout = self.timeout;
        self.entries.retain(|e| {
            let keep = e.timeout_accumulator <= timeout;
            if !keep {
                log::info!("server '{}' at {} timed out", e.name, e.address);
            }
            keep
        });
    }

    /// Validates one advertisement datagram and upserts its table entry.
    /// Public so discovery can be exercised without broadcast sockets.
    pub fn process_packet(&mut self, from: Address, data: &[u8]) {
        let ad = match Advertisement::decode(self.protocol_id, data) {
            Ok(ad) => ad,
            Err(e) => {
                log::trace!("dropping advertisement from {}: {}", from, e);
                return;
            }
        };
        let address = from.with_port(ad.server_port);
        match self
            .entries
            .iter_mut()
            .find(|e| e.address == address && e.name == ad.name)
        {
            Some(entry) => entry.timeout_accumulator = 0.0,
            None => {
                log::info!("discovered server '{}' at {}", ad.name, address);
                self.entries.push(ListenerEntry {
                    name: ad.name,
                    address,
                    timeout_accumulator: 0.0,
                });
            }
        }
    }
}

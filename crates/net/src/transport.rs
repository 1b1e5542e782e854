//! Top-level façade owning the mesh, node, beacon, and listener, with a
//! single send/receive/update surface and explicit configuration. The
//! `Transport` value is the only handle; there is no process-wide state.

use std::io;

use crate::address::Address;
use crate::discovery::{Beacon, Listener};
use crate::mesh::Mesh;
use crate::node::Node;

/// Static network configuration. The five ports are distinct by
/// convention; `max_nodes` is fixed for the lifetime of the transport.
#[derive(Debug, Clone)]
pub struct Config {
    pub mesh_port: u16,
    pub server_port: u16,
    pub client_port: u16,
    pub beacon_port: u16,
    pub listener_port: u16,
    pub protocol_id: u32,
    pub mesh_send_rate: f32,
    pub timeout: f32,
    pub max_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mesh_port: 30000,
            server_port: 30001,
            client_port: 30002,
            beacon_port: 30003,
            listener_port: 30004,
            protocol_id: 0x4C4D_5348,
            mesh_send_rate: 0.25,
            timeout: 10.0,
            max_nodes: 16,
        }
    }
}

/// One browseable server advertisement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LobbyEntry {
    pub name: String,
    pub address: Address,
}

#[derive(Debug)]
pub struct Transport {
    config: Config,
    mesh: Option<Mesh>,
    node: Option<Node>,
    beacon: Option<Beacon>,
    listener: Option<Listener>,
    connect_name: Option<String>,
    connect_accumulator: f32,
    connect_failed: bool,
    in_lobby: bool,
}

impl Default for Transport {
    fn default() -> Self {
        Self::new()
    }
}

impl Transport {
    pub fn new() -> Self {
        Self::with_config(Config::default())
    }

    pub fn with_config(config: Config) -> Self {
        Self {
            config,
            mesh: None,
            node: None,
            beacon: None,
            listener: None,
            connect_name: None,
            connect_accumulator: 0.0,
            connect_failed: false,
            in_lobby: false,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Starts a server: beacon advertising `name`, the mesh authority, and
    /// the server's own loopback node reserved in slot 0. On failure every
    /// partially started sub-component is torn down.
    pub fn start_server(&mut self, name: &str) -> io::Result<()> {
        if self.mesh.is_some() || self.node.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport already started",
            ));
        }
        if self.config.max_nodes == 0 || self.config.max_nodes > u8::MAX as usize {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "max_nodes must be between 1 and 255",
            ));
        }
        log::info!("starting server '{}'", name);

        let mut beacon = Beacon::new(
            name,
            self.config.protocol_id,
            self.config.listener_port,
            self.config.server_port,
        );
        beacon.start(self.config.beacon_port)?;

        let mut mesh = Mesh::with_rates(
            self.config.protocol_id,
            self.config.max_nodes,
            self.config.mesh_send_rate,
            self.config.timeout,
        );
        if let Err(e) = mesh.start(self.config.mesh_port) {
            beacon.stop();
            return Err(e);
        }

        let mut node = Node::with_rates(
            self.config.protocol_id,
            self.config.mesh_send_rate,
            self.config.timeout,
        );
        if let Err(e) = node.start(self.config.server_port) {
            mesh.stop();
            beacon.stop();
            return Err(e);
        }

        // Slot 0 is the server's own loopback node.
        mesh.reserve(0, Address::new(127, 0, 0, 1, self.config.server_port));
        node.join(Address::new(127, 0, 0, 1, self.config.mesh_port));

        self.beacon = Some(beacon);
        self.mesh = Some(mesh);
        self.node = Some(node);
        Ok(())
    }

    /// Connects to a server given either a dotted address (optionally with
    /// a port, otherwise the configured mesh port) or an advertised server
    /// name, in which case the join waits for a matching advertisement.
    pub fn connect_client(&mut self, server: &str) -> io::Result<()> {
        if self.mesh.is_some() || self.node.is_some() {
            return Err(io::Error::new(
                io::ErrorKind::AlreadyExists,
                "transport already started",
            ));
        }
        if let Ok(addr) = server.parse::<Address>() {
            let target = if addr.port() == 0 {
                addr.with_port(self.config.mesh_port)
            } else {
                addr
            };
            log::info!("connecting to {}", target);
            let mut node = self.make_client_node()?;
            node.join(target);
            self.node = Some(node);
        } else {
            log::info!("resolving server '{}' via lan listener", server);
            self.ensure_listener()?;
            self.connect_name = Some(server.to_owned());
            self.connect_accumulator = 0.0;
            self.connect_failed = false;
        }
        Ok(())
    }

    fn make_client_node(&self) -> io::Result<Node> {
        let mut node = Node::with_rates(
            self.config.protocol_id,
            self.config.mesh_send_rate,
            self.config.timeout,
        );
        node.start(self.config.client_port)?;
        Ok(node)
    }

    fn ensure_listener(&mut self) -> io::Result<()> {
        if self.listener.is_none() {
            let mut listener = Listener::new(self.config.protocol_id, self.config.timeout);
            listener.start(self.config.listener_port)?;
            self.listener = Some(listener);
        }
        Ok(())
    }

    /// Opens the lobby: the listener table becomes browseable without
    /// committing to a connection.
    pub fn enter_lobby(&mut self) -> io::Result<()> {
        self.ensure_listener()?;
        self.in_lobby = true;
        Ok(())
    }

    pub fn leave_lobby(&mut self) {
        self.in_lobby = false;
        if self.connect_name.is_none() {
            if let Some(listener) = &mut self.listener {
                listener.stop();
            }
            self.listener = None;
        }
    }

    pub fn lobby_entry_count(&self) -> usize {
        self.listener.as_ref().map_or(0, |l| l.entry_count())
    }

    pub fn lobby_entry(&self, index: usize) -> Option<LobbyEntry> {
        self.listener.as_ref().and_then(|l| {
            l.entry(index).map(|e| LobbyEntry {
                name: e.name.clone(),
                address: e.address,
            })
        })
    }

    pub fn is_server(&self) -> bool {
        self.mesh.is_some()
    }

    pub fn is_connected(&self) -> bool {
        self.node.as_ref().is_some_and(|n| n.is_connected())
    }

    pub fn connect_failed(&self) -> bool {
        self.connect_failed || self.node.as_ref().is_some_and(|n| n.join_failed())
    }

    pub fn local_node_id(&self) -> Option<usize> {
        self.node.as_ref().and_then(|n| n.local_node_id())
    }

    /// Size of the membership table: the configured maximum on a server,
    /// the mesh-reported total on a client (0 until joined).
    pub fn max_nodes(&self) -> usize {
        if self.mesh.is_some() {
            self.config.max_nodes
        } else {
            self.node.as_ref().map_or(0, |n| n.max_nodes())
        }
    }

    pub fn is_node_connected(&self, node_id: usize) -> bool {
        self.node
            .as_ref()
            .is_some_and(|n| n.is_node_connected(node_id))
    }

    pub fn node_address(&self, node_id: usize) -> Option<Address> {
        self.node.as_ref().and_then(|n| n.node_address(node_id))
    }

    pub fn send_packet(&self, node_id: usize, payload: &[u8]) -> bool {
        self.node
            .as_ref()
            .is_some_and(|n| n.send_packet(node_id, payload))
    }

    pub fn receive_packet(&mut self) -> Option<(usize, Vec<u8>)> {
        self.node.as_mut().and_then(|n| n.receive_packet())
    }

    /// Advances every owned sub-component: the deferred by-name connect
    /// first, then mesh, node, beacon, and listener.
    pub fn update(&mut self, dt: f32) {
        self.update_name_resolution(dt);
        if let Some(mesh) = &mut self.mesh {
            mesh.update(dt);
        }
        if let Some(node) = &mut self.node {
            node.update(dt);
        }
        if let Some(beacon) = &mut self.beacon {
            beacon.update(dt);
        }
        if let Some(listener) = &mut self.listener {
            listener.update(dt);
        }
    }

    fn update_name_resolution(&mut self, dt: f32) {
        let Some(name) = self.connect_name.clone() else {
            return;
        };
        let found = self
            .listener
            .as_ref()
            .and_then(|l| l.find_by_name(&name))
            .map(|e| e.address);

        if let Some(address) = found {
            // The advertisement carries the game port; the join targets the
            // advertiser's mesh port.
            let target = address.with_port(self.config.mesh_port);
            log::info!("server '{}' resolved to {}", name, target);
            self.connect_name = None;
            match self.make_client_node() {
                Ok(mut node) => {
                    node.join(target);
                    self.node = Some(node);
                }
                Err(e) => {
                    log::warn!("client node start failed: {}", e);
                    self.connect_failed = true;
                }
            }
            if !self.in_lobby {
                if let Some(listener) = &mut self.listener {
                    listener.stop();
                }
                self.listener = None;
            }
        } else {
            self.connect_accumulator += dt;
            if self.connect_accumulator > self.config.timeout {
                log::warn!("server '{}' not found before timeout", name);
                self.connect_name = None;
                self.connect_failed = true;
                if !self.in_lobby {
                    if let Some(listener) = &mut self.listener {
                        listener.stop();
                    }
                    self.listener = None;
                }
            }
        }
    }

    pub fn stop(&mut self) {
        log::info!("transport stopping");
        if let Some(mesh) = &mut self.mesh {
            mesh.stop();
        }
        if let Some(node) = &mut self.node {
            node.stop();
        }
        if let Some(beacon) = &mut self.beacon {
            beacon.stop();
        }
        if let Some(listener) = &mut self.listener {
            listener.stop();
        }
        self.mesh = None;
        self.node = None;
        self.beacon = None;
        self.listener = None;
        self.connect_name = None;
        self.connect_accumulator = 0.0;
        self.connect_failed = false;
        self.in_lobby = false;
    }
}

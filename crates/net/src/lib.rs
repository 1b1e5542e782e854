//! Reliable UDP transport and LAN discovery for small mesh sessions.
//!
//! Everything here is single-threaded and poll-driven: sockets are
//! non-blocking and each component advances through `update(dt)` calls from
//! one external tick loop.

pub mod address;
pub mod connection;
pub mod discovery;
pub mod flow;
pub mod mesh;
pub mod node;
pub mod reliability;
pub mod socket;
pub mod transport;
pub mod wire;

pub use address::Address;
pub use connection::{Connection, ConnectionEvent, ConnectionState};
pub use discovery::{Beacon, Listener, ListenerEntry};
pub use flow::{FlowControl, FlowMode, DEFAULT_RTT_THRESHOLD};
pub use mesh::{Mesh, SlotState};
pub use node::{Node, NodeState};
pub use reliability::{
    bit_index_for_sequence, generate_ack_bits, sequence_more_recent, PacketData, PacketQueue,
    ReliabilitySystem,
};
pub use socket::Socket;
pub use transport::{Config, LobbyEntry, Transport};
pub use wire::{
    Advertisement, MeshCommand, MeshMessage, ReliableHeader, WireError, MAX_SERVER_NAME_LENGTH,
    PROTOCOL_HEADER_SIZE, RELIABLE_HEADER_SIZE,
};

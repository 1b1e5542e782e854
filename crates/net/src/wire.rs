//! Datagram layouts, encoded and decoded field by field.
//!
//! Every multi-byte integer is big-endian. Decoding never reads past the
//! buffer: short or malformed input comes back as a `WireError` and the
//! caller drops the datagram.

use crate::address::Address;

/// Leading protocol-id magic carried by every datagram.
pub const PROTOCOL_HEADER_SIZE: usize = 4;
/// `sequence`, `ack`, `ack_bits` after the protocol header.
pub const RELIABLE_HEADER_SIZE: usize = 12;
/// Join request / keep-alive: protocol header plus one type byte.
pub const MESH_COMMAND_SIZE: usize = 5;
/// Connection accept: command plus `node_id` and `total_nodes`.
pub const CONNECTION_ACCEPT_SIZE: usize = 7;
/// Bytes per slot in a mesh update packet: four address octets plus a port.
pub const UPDATE_BYTES_PER_NODE: usize = 6;
/// Beacon advertisement before the name bytes.
pub const ADVERTISEMENT_FIXED_SIZE: usize = 13;
/// Longest advertised server name.
pub const MAX_SERVER_NAME_LENGTH: usize = 63;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("datagram truncated at {len} bytes")]
    Truncated { len: usize },
    #[error("protocol id mismatch")]
    BadProtocolId,
    #[error("unknown packet type {0}")]
    UnknownType(u8),
    #[error("bad {what} length {len}")]
    BadLength { what: &'static str, len: usize },
    #[error("server name length {0} out of range")]
    BadNameLength(usize),
    #[error("server name is not valid utf-8")]
    BadName,
    #[error("reserved field is not zero")]
    NonZeroReserved,
}

fn read_u16(data: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([data[offset], data[offset + 1]])
}

fn read_u32(data: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        data[offset],
        data[offset + 1],
        data[offset + 2],
        data[offset + 3],
    ])
}

pub fn write_protocol_header(out: &mut Vec<u8>, protocol_id: u32) {
    out.extend_from_slice(&protocol_id.to_be_bytes());
}

/// Validates the magic and returns the remaining payload.
pub fn strip_protocol_header(protocol_id: u32, data: &[u8]) -> Result<&[u8], WireError> {
    if data.len() < PROTOCOL_HEADER_SIZE {
        return Err(WireError::Truncated { len: data.len() });
    }
    if read_u32(data, 0) != protocol_id {
        return Err(WireError::BadProtocolId);
    }
    Ok(&data[PROTOCOL_HEADER_SIZE..])
}

/// Reliability header carried after the protocol magic on reliable
/// connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReliableHeader {
    pub sequence: u32,
    pub ack: u32,
    pub ack_bits: u32,
}

impl ReliableHeader {
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&self.sequence.to_be_bytes());
        out.extend_from_slice(&self.ack.to_be_bytes());
        out.extend_from_slice(&self.ack_bits.to_be_bytes());
    }

    /// Decodes the header and returns it with the trailing payload.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if data.len() < RELIABLE_HEADER_SIZE {
            return Err(WireError::Truncated { len: data.len() });
        }
        let header = Self {
            sequence: read_u32(data, 0),
            ack: read_u32(data, 4),
            ack_bits: read_u32(data, 8),
        };
        Ok((header, &data[RELIABLE_HEADER_SIZE..]))
    }
}

/// Node-to-mesh commands. Both are exactly 5 bytes on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MeshCommand {
    JoinRequest,
    KeepAlive,
}

impl MeshCommand {
    fn type_byte(&self) -> u8 {
        match self {
            MeshCommand::JoinRequest => 0,
            MeshCommand::KeepAlive => 1,
        }
    }

    pub fn encode(&self, protocol_id: u32) -> Vec<u8> {
        let mut out = Vec::with_capacity(MESH_COMMAND_SIZE);
        write_protocol_header(&mut out, protocol_id);
        out.push(self.type_byte());
        out
    }

    pub fn decode(protocol_id: u32, data: &[u8]) -> Result<Self, WireError> {
        let body = strip_protocol_header(protocol_id, data)?;
        if body.len() != 1 {
            return Err(WireError::BadLength {
                what: "mesh command",
                len: data.len(),
            });
        }
        match body[0] {
            0 => Ok(MeshCommand::JoinRequest),
            1 => Ok(MeshCommand::KeepAlive),
            t => Err(WireError::UnknownType(t)),
        }
    }
}

/// Mesh-to-node messages: the 7-byte connection accept and the
/// variable-length membership update (5 + 6 bytes per slot, a zero address
/// marking a vacant slot).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MeshMessage {
    ConnectionAccept { node_id: u8, total_nodes: u8 },
    Update { slots: Vec<Address> },
}

impl MeshMessage {
    pub fn encode(&self, protocol_id: u32) -> Vec<u8> {
        match self {
            MeshMessage::ConnectionAccept {
                node_id,
                total_nodes,
            } => {
                let mut out = Vec::with_capacity(CONNECTION_ACCEPT_SIZE);
                write_protocol_header(&mut out, protocol_id);
                out.push(0);
                out.push(*node_id);
                out.push(*total_nodes);
                out
            }
            MeshMessage::Update { slots } => {
                let mut out =
                    Vec::with_capacity(MESH_COMMAND_SIZE + slots.len() * UPDATE_BYTES_PER_NODE);
                write_protocol_header(&mut out, protocol_id);
                out.push(1);
                for slot in slots {
                    out.extend_from_slice(&slot.octets());
                    out.extend_from_slice(&slot.port().to_be_bytes());
                }
                out
            }
        }
    }

    pub fn decode(protocol_id: u32, data: &[u8]) -> Result<Self, WireError> {
        let body = strip_protocol_header(protocol_id, data)?;
        let (&type_byte, rest) = body
            .split_first()
            .ok_or(WireError::Truncated { len: data.len() })?;
        match type_byte {
            0 => {
                if rest.len() != 2 {
                    return Err(WireError::BadLength {
                        what: "connection accept",
                        len: data.len(),
                    });
                }
                Ok(MeshMessage::ConnectionAccept {
                    node_id: rest[0],
                    total_nodes: rest[1],
                })
            }
            1 => {
                if rest.is_empty() || rest.len() % UPDATE_BYTES_PER_NODE != 0 {
                    return Err(WireError::BadLength {
                        what: "mesh update",
                        len: data.len(),
                    });
                }
                let slots = rest
                    .chunks_exact(UPDATE_BYTES_PER_NODE)
                    .map(|chunk| {
                        Address::new(chunk[0], chunk[1], chunk[2], chunk[3], read_u16(chunk, 4))
                    })
                    .collect();
                Ok(MeshMessage::Update { slots })
            }
            t => Err(WireError::UnknownType(t)),
        }
    }
}

/// LAN beacon advertisement: reserved zero word, protocol id, the server's
/// game port, a pad word, then a length-prefixed name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Advertisement {
    pub protocol_id: u32,
    pub server_port: u16,
    pub name: String,
}

impl Advertisement {
    pub fn encode(&self) -> Vec<u8> {
        debug_assert!(self.name.len() <= MAX_SERVER_NAME_LENGTH);
        let mut out = Vec::with_capacity(ADVERTISEMENT_FIXED_SIZE + self.name.len());
        out.extend_from_slice(&0u32.to_be_bytes());
        out.extend_from_slice(&self.protocol_id.to_be_bytes());
        out.extend_from_slice(&self.server_port.to_be_bytes());
        out.extend_from_slice(&0u16.to_be_bytes());
        out.push(self.name.len() as u8);
        out.extend_from_slice(self.name.as_bytes());
        out
    }

    pub fn decode(protocol_id: u32, data: &[u8]) -> Result<Self, WireError> {
        if data.len() < ADVERTISEMENT_FIXED_SIZE {
            return Err(WireError::Truncated { len: data.len() });
        }
        if read_u32(data, 0) != 0 {
            return Err(WireError::NonZeroReserved);
        }
        if read_u32(data, 4) != protocol_id {
            return Err(WireError::BadProtocolId);
        }
        let server_port = read_u16(data, 8);
        let name_len = data[12] as usize;
        if name_len > MAX_SERVER_NAME_LENGTH {
            return Err(WireError::BadNameLength(name_len));
        }
        if data.len() != ADVERTISEMENT_FIXED_SIZE + name_len {
            return Err(WireError::BadLength {
                what: "advertisement",
                len: data.len(),
            });
        }
        let name = std::str::from_utf8(&data[13..13 + name_len])
            .map_err(|_| WireError::BadName)?
            .to_owned();
        Ok(Self {
            protocol_id,
            server_port,
            name,
        })
    }
}

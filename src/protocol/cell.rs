//! Fixed-size cell codec
//!
//! Cells are the atomic unit of the wire protocol: 2-byte circuit id
//! (big-endian), 1-byte command, 509-byte payload — always exactly 512
//! bytes on the wire, zero-padded. Parsing and serialization are pure
//! transforms with no side effects.

use crate::error::{Result, TorError};

/// Cell command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CellCommand {
    /// PADDING - keep-alive, payload is meaningless
    Padding = 0,
    /// CREATE - open a circuit at the first hop
    Create = 1,
    /// CREATED - first hop's handshake answer
    Created = 2,
    /// RELAY - onion-encrypted relay cell
    Relay = 3,
    /// DESTROY - tear down a circuit
    Destroy = 4,
    /// CREATE_FAST - first-hop creation without DH
    CreateFast = 5,
    /// CREATED_FAST - answer to CREATE_FAST
    CreatedFast = 6,
    /// VERSIONS - link version negotiation
    Versions = 7,
    /// NETINFO - network info exchange
    Netinfo = 8,
    /// RELAY_EARLY - relay cell allowed during circuit buildup
    RelayEarly = 9,
}

impl CellCommand {
    /// Parse command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            0 => Some(CellCommand::Padding),
            1 => Some(CellCommand::Create),
            2 => Some(CellCommand::Created),
            3 => Some(CellCommand::Relay),
            4 => Some(CellCommand::Destroy),
            5 => Some(CellCommand::CreateFast),
            6 => Some(CellCommand::CreatedFast),
            7 => Some(CellCommand::Versions),
            8 => Some(CellCommand::Netinfo),
            9 => Some(CellCommand::RelayEarly),
            _ => None,
        }
    }

    /// Whether this command carries an onion-encrypted relay payload
    pub fn is_relay(self) -> bool {
        matches!(self, CellCommand::Relay | CellCommand::RelayEarly)
    }
}

/// A fixed-size wire cell
#[derive(Debug, Clone)]
pub struct Cell {
    /// Circuit ID (scoped to one transport connection)
    pub circuit_id: u16,

    /// Command
    pub command: CellCommand,

    /// Payload, zero-padded to the fixed size
    pub payload: [u8; Cell::PAYLOAD_SIZE],
}

impl Cell {
    /// Total wire size: 2 circuit_id + 1 command + 509 payload
    pub const SIZE: usize = 512;

    /// Payload size
    pub const PAYLOAD_SIZE: usize = 509;

    /// Create a new cell; `payload` shorter than the fixed size is
    /// zero-padded. Oversized payloads are a caller bug and are truncated.
    pub fn new(circuit_id: u16, command: CellCommand, payload: &[u8]) -> Self {
        let mut buf = [0u8; Self::PAYLOAD_SIZE];
        let len = payload.len().min(Self::PAYLOAD_SIZE);
        buf[..len].copy_from_slice(&payload[..len]);
        Self {
            circuit_id,
            command,
            payload: buf,
        }
    }

    /// Create a RELAY cell from an already-encrypted relay payload
    pub fn relay(circuit_id: u16, payload: [u8; Cell::PAYLOAD_SIZE]) -> Self {
        Self {
            circuit_id,
            command: CellCommand::Relay,
            payload,
        }
    }

    /// Create a RELAY_EARLY cell (used while the circuit is still building)
    pub fn relay_early(circuit_id: u16, payload: [u8; Cell::PAYLOAD_SIZE]) -> Self {
        Self {
            circuit_id,
            command: CellCommand::RelayEarly,
            payload,
        }
    }

    /// Create a PADDING keep-alive cell
    pub fn padding(circuit_id: u16) -> Self {
        Self::new(circuit_id, CellCommand::Padding, &[])
    }

    /// Create a DESTROY cell with a one-byte reason code
    pub fn destroy(circuit_id: u16, reason: u8) -> Self {
        Self::new(circuit_id, CellCommand::Destroy, &[reason])
    }

    /// Serialize cell to exactly `Cell::SIZE` bytes
    pub fn to_bytes(&self) -> [u8; Cell::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..2].copy_from_slice(&self.circuit_id.to_be_bytes());
        buf[2] = self.command as u8;
        buf[3..].copy_from_slice(&self.payload);
        buf
    }

    /// Parse cell from bytes
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TorError::CellTruncated);
        }

        let circuit_id = u16::from_be_bytes([data[0], data[1]]);
        let command = CellCommand::from_u8(data[2]).ok_or(TorError::UnknownCommand(data[2]))?;

        let mut payload = [0u8; Self::PAYLOAD_SIZE];
        payload.copy_from_slice(&data[3..Self::SIZE]);

        Ok(Self {
            circuit_id,
            command,
            payload,
        })
    }
}

//! Relay cell codec and onion transform
//!
//! A relay cell is the sub-message inside a RELAY/RELAY_EARLY cell payload:
//!
//! ```text
//! cmd(1) || recognized(2) || stream_id(2) || digest(4) || length(2) || data(<=498)
//! ```
//!
//! zero-padded to the full 509-byte cell payload. The digest is a 4-byte
//! truncation of the per-hop running SHA1 computed over the whole payload
//! with the digest field zeroed.
//!
//! `encode`/`decode` implement the layered onion transform over an ordered
//! hop slice. The caller passes only the established prefix of the route,
//! so neither path can ever touch an unfinished hop.

use crate::error::{Result, TorError};
use crate::protocol::cell::Cell;
use crate::protocol::node::Node;

/// Relay command types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RelayCommand {
    /// BEGIN - open a stream
    Begin = 1,
    /// DATA - stream payload bytes
    Data = 2,
    /// END - close a stream (one-byte reason)
    End = 3,
    /// CONNECTED - stream open succeeded
    Connected = 4,
    /// SENDME - flow-control credit
    Sendme = 5,
    /// EXTEND - extend the circuit by one hop
    Extend = 6,
    /// EXTENDED - extension handshake answer
    Extended = 7,
    /// TRUNCATE - drop circuit hops
    Truncate = 8,
    /// TRUNCATED - truncation confirmed
    Truncated = 9,
    /// DROP - long-range padding
    Drop = 10,
    /// RESOLVE - hostname lookup
    Resolve = 11,
    /// RESOLVED - hostname lookup answer
    Resolved = 12,
    /// BEGIN_DIR - open a directory stream
    BeginDir = 13,
    /// ESTABLISH_INTRO - hidden service: register introduction point
    EstablishIntro = 32,
    /// ESTABLISH_RENDEZVOUS - hidden service: register rendezvous point
    EstablishRendezvous = 33,
    /// INTRODUCE1 - hidden service: client introduction
    Introduce1 = 34,
    /// INTRODUCE2 - hidden service: introduction delivered to the service
    Introduce2 = 35,
    /// RENDEZVOUS1 - hidden service: service side of the rendezvous splice
    Rendezvous1 = 36,
    /// RENDEZVOUS2 - hidden service: client side of the rendezvous splice
    Rendezvous2 = 37,
    /// INTRO_ESTABLISHED - introduction point confirmed
    IntroEstablished = 38,
    /// RENDEZVOUS_ESTABLISHED - rendezvous point confirmed
    RendezvousEstablished = 39,
    /// INTRODUCE_ACK - introduction acknowledged
    IntroduceAck = 40,
}

impl RelayCommand {
    /// Parse relay command from byte
    pub fn from_u8(cmd: u8) -> Option<Self> {
        match cmd {
            1 => Some(RelayCommand::Begin),
            2 => Some(RelayCommand::Data),
            3 => Some(RelayCommand::End),
            4 => Some(RelayCommand::Connected),
            5 => Some(RelayCommand::Sendme),
            6 => Some(RelayCommand::Extend),
            7 => Some(RelayCommand::Extended),
            8 => Some(RelayCommand::Truncate),
            9 => Some(RelayCommand::Truncated),
            10 => Some(RelayCommand::Drop),
            11 => Some(RelayCommand::Resolve),
            12 => Some(RelayCommand::Resolved),
            13 => Some(RelayCommand::BeginDir),
            32 => Some(RelayCommand::EstablishIntro),
            33 => Some(RelayCommand::EstablishRendezvous),
            34 => Some(RelayCommand::Introduce1),
            35 => Some(RelayCommand::Introduce2),
            36 => Some(RelayCommand::Rendezvous1),
            37 => Some(RelayCommand::Rendezvous2),
            38 => Some(RelayCommand::IntroEstablished),
            39 => Some(RelayCommand::RendezvousEstablished),
            40 => Some(RelayCommand::IntroduceAck),
            _ => None,
        }
    }

    /// Whether this is the RESOLVE request command
    pub fn is_resolve(self) -> bool {
        self == RelayCommand::Resolve
    }

    /// Whether this is the RESOLVED answer command
    pub fn is_resolved(self) -> bool {
        self == RelayCommand::Resolved
    }
}

/// Logical view of a relay-type cell payload
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayCell {
    /// Relay command
    pub command: RelayCommand,

    /// Recognized field (zero once correctly decrypted)
    pub recognized: u16,

    /// Stream ID; 0 addresses the circuit itself
    pub stream_id: u16,

    /// 4-byte truncated running digest
    pub digest: [u8; 4],

    /// Length of `data`
    pub length: u16,

    /// Data (up to `MAX_DATA_SIZE` bytes)
    pub data: Vec<u8>,
}

impl RelayCell {
    /// Relay sub-header length
    pub const HEADER_SIZE: usize = 11;

    /// Maximum data bytes in one relay cell
    pub const MAX_DATA_SIZE: usize = Cell::PAYLOAD_SIZE - Self::HEADER_SIZE;

    /// Create a new relay cell; fails if `data` exceeds the fixed buffer.
    pub fn new(command: RelayCommand, stream_id: u16, data: Vec<u8>) -> Result<Self> {
        if data.len() > Self::MAX_DATA_SIZE {
            return Err(TorError::ProtocolViolation(format!(
                "relay data too long: {} > {}",
                data.len(),
                Self::MAX_DATA_SIZE
            )));
        }
        Ok(Self {
            command,
            recognized: 0,
            stream_id,
            digest: [0; 4],
            length: data.len() as u16,
            data,
        })
    }

    /// Serialize into a full zero-padded cell payload (digest field as-is)
    pub fn to_payload(&self) -> [u8; Cell::PAYLOAD_SIZE] {
        let mut buf = [0u8; Cell::PAYLOAD_SIZE];
        buf[0] = self.command as u8;
        buf[1..3].copy_from_slice(&self.recognized.to_be_bytes());
        buf[3..5].copy_from_slice(&self.stream_id.to_be_bytes());
        buf[5..9].copy_from_slice(&self.digest);
        buf[9..11].copy_from_slice(&self.length.to_be_bytes());
        buf[Self::HEADER_SIZE..Self::HEADER_SIZE + self.data.len()].copy_from_slice(&self.data);
        buf
    }

    /// Parse a plaintext cell payload
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        if payload.len() < Self::HEADER_SIZE {
            return Err(TorError::CellTruncated);
        }

        let command =
            RelayCommand::from_u8(payload[0]).ok_or(TorError::UnknownRelayCommand(payload[0]))?;
        let recognized = u16::from_be_bytes([payload[1], payload[2]]);
        let stream_id = u16::from_be_bytes([payload[3], payload[4]]);
        let digest = [payload[5], payload[6], payload[7], payload[8]];
        let length = u16::from_be_bytes([payload[9], payload[10]]);

        if length as usize > Self::MAX_DATA_SIZE
            || Self::HEADER_SIZE + length as usize > payload.len()
        {
            return Err(TorError::ProtocolViolation(format!(
                "relay length field out of range: {}",
                length
            )));
        }

        let data = payload[Self::HEADER_SIZE..Self::HEADER_SIZE + length as usize].to_vec();

        Ok(Self {
            command,
            recognized,
            stream_id,
            digest,
            length,
            data,
        })
    }
}

/// Wrap a relay cell in onion layers for the given established hop chain.
///
/// `target` is the hop the cell is addressed to (default: the last
/// established hop; earlier hops are used by multi-hop protocols such as
/// rendezvous setup). The target hop's forward running digest is advanced
/// destructively, then layers are applied innermost-first so the hop
/// closest to the client encrypts last.
pub fn encode(nodes: &mut [Node], target: Option<usize>, cell: &RelayCell) -> Result<[u8; Cell::PAYLOAD_SIZE]> {
    if nodes.is_empty() {
        return Err(TorError::ProtocolViolation(
            "cannot encode relay cell on a circuit with no established hops".into(),
        ));
    }
    let hop = target.unwrap_or(nodes.len() - 1);
    if hop >= nodes.len() {
        return Err(TorError::ProtocolViolation(format!(
            "target hop {} beyond established chain of {}",
            hop,
            nodes.len()
        )));
    }

    let mut payload = cell.to_payload();
    // Digest is computed with the digest field zeroed
    payload[5..9].copy_from_slice(&[0; 4]);

    let digest = nodes[hop].forward_digest(&payload)?;
    payload[5..9].copy_from_slice(&digest);

    for node in nodes[..=hop].iter_mut().rev() {
        node.encrypt_forward(&mut payload)?;
    }

    Ok(payload)
}

/// Strip onion layers from an inbound relay payload until some hop
/// recognizes it.
///
/// Each hop removes exactly one layer of its own encryption; the client
/// cannot know in advance which hop originated the cell, so layers are
/// peeled in chain order and each zero "recognized" field is only a
/// candidate, confirmed by the hop's backward running digest. A failed
/// candidate must not disturb the digest accumulator (the trial works on a
/// clone), and the loop exhausting the chain is `RelayDecryptionFailed`.
///
/// Returns the recognizing hop index and the parsed cell.
pub fn decode(nodes: &mut [Node], payload: &mut [u8; Cell::PAYLOAD_SIZE]) -> Result<(usize, RelayCell)> {
    for i in 0..nodes.len() {
        nodes[i].decrypt_backward(payload)?;

        // Zero "recognized" bits may be coincidental; only the digest
        // check decides.
        if payload[1] != 0 || payload[2] != 0 {
            continue;
        }

        let mut claimed = [0u8; 4];
        claimed.copy_from_slice(&payload[5..9]);
        payload[5..9].copy_from_slice(&[0; 4]);

        if nodes[i].check_backward_digest(payload, &claimed)? {
            payload[5..9].copy_from_slice(&claimed);
            let cell = RelayCell::from_payload(payload)?;
            return Ok((i, cell));
        }

        payload[5..9].copy_from_slice(&claimed);
    }

    Err(TorError::RelayDecryptionFailed)
}

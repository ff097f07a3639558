//! Router identity and the collaborator seams the engine consumes
//!
//! Directory/consensus handling lives outside this crate; the engine only
//! needs a value type describing one relay plus three narrow interfaces:
//! route selection (with punishment feedback), the asymmetric wrapping of
//! CREATE onion skins under a router's onion key, and lifecycle event
//! notifications.

use crate::error::{Result, TorError};
use std::fmt;
use std::net::Ipv4Addr;
use std::sync::Arc;

/// Asymmetric wrapping of handshake material under a router's onion key.
///
/// The concrete public-key scheme is outside this crate; relays are handed
/// in with their cipher attached. `decrypt` exists for responder-side use
/// (in-process test relays included) and may be unsupported by client-only
/// key handles.
pub trait OnionSkinCipher: Send + Sync {
    /// Encrypt handshake material to the router's onion key
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Unwrap handshake material (responder side)
    fn decrypt(&self, _ciphertext: &[u8]) -> Result<Vec<u8>> {
        Err(TorError::HandshakeFailed(
            "onion key handle cannot decrypt".into(),
        ))
    }
}

/// A relay this engine can build circuits through
#[derive(Clone)]
pub struct Router {
    /// Relay nickname (log display only)
    pub nickname: String,

    /// Hex-encoded 20-byte identity fingerprint
    pub fingerprint: String,

    /// IPv4 address
    pub address: Ipv4Addr,

    /// Onion-routing port
    pub or_port: u16,

    /// Handle to the router's onion key
    pub onion_key: Arc<dyn OnionSkinCipher>,
}

impl Router {
    /// Identity fingerprint as raw bytes
    pub fn fingerprint_bytes(&self) -> Result<[u8; 20]> {
        let bytes = hex::decode(&self.fingerprint)
            .map_err(|e| TorError::ProtocolViolation(format!("bad fingerprint hex: {}", e)))?;
        if bytes.len() != 20 {
            return Err(TorError::ProtocolViolation(format!(
                "fingerprint must be 20 bytes, got {}",
                bytes.len()
            )));
        }
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(out)
    }

    /// A router with a pass-through onion key, for tests and mock networks
    pub fn for_tests(nickname: &str) -> Self {
        use sha1::{Digest, Sha1};
        let fingerprint = hex::encode(Sha1::digest(nickname.as_bytes()));
        Self {
            nickname: nickname.to_string(),
            fingerprint,
            address: Ipv4Addr::new(10, 0, 0, 1),
            or_port: 9001,
            onion_key: Arc::new(PlaintextOnionKey),
        }
    }
}

impl fmt::Debug for Router {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Router")
            .field("nickname", &self.nickname)
            .field("fingerprint", &self.fingerprint)
            .field("address", &self.address)
            .field("or_port", &self.or_port)
            .finish()
    }
}

/// Pass-through onion key used by `Router::for_tests` and mock relays
pub struct PlaintextOnionKey;

impl OnionSkinCipher for PlaintextOnionKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        Ok(ciphertext.to_vec())
    }
}

/// Route selection service consumed by the circuit builder.
///
/// Implementations rank and pick relays however they like; the engine only
/// requires that the returned route respects `exclude` (fingerprints of
/// hops already in use or known-bad) and reports failed hops back through
/// `punish`.
pub trait RouterSelector: Send + Sync {
    /// Select an ordered route of `len` relays avoiding `exclude`
    fn select_route(&self, len: usize, exclude: &[String]) -> Result<Vec<Router>>;

    /// Down-rank a relay after it failed during circuit construction
    fn punish(&self, fingerprint: &str);
}

/// Lifecycle notifications emitted by the engine. All methods default to
/// no-ops so listeners implement only what they care about.
pub trait CircuitEvents: Send + Sync {
    fn circuit_built(&self, _circuit_id: u16) {}
    fn circuit_closed(&self, _circuit_id: u16) {}
    fn stream_built(&self, _circuit_id: u16, _stream_id: u16) {}
    fn stream_closed(&self, _circuit_id: u16, _stream_id: u16) {}
}

/// Default listener that ignores every event
pub struct NoEvents;

impl CircuitEvents for NoEvents {}

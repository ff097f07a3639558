//! Per-hop handshake and keystream state
//!
//! A `Node` is one router's cryptographic state within a circuit. The
//! client generates an ephemeral keypair in the protocol's fixed 1024-bit
//! Diffie-Hellman group, ships the public value in a CREATE/EXTEND onion
//! skin, and finalizes the hop once the peer's half arrives:
//!
//! - shared secret = peer^private mod p, canonicalized to 128 bytes
//! - 100 bytes of key material via the 5xSHA1 stretch
//!   `SHA1(s||0) || SHA1(s||1) || ... || SHA1(s||4)`
//! - bytes 0..20 (KH) authenticate the exchange; 20..40 and 40..60 seed the
//!   forward/backward running digests; 60..76 and 76..92 are the AES-128
//!   keys for the forward/backward CTR keystreams (counter starts at zero)
//!
//! The forward/backward naming is relative to the data's travel direction,
//! not to role: a server-role node derives the same 100 bytes but assigns
//! the halves swapped, so its "forward" matches the client's "backward".
//!
//! Security: derived key material is zeroized on drop.

use crate::error::{Result, TorError};
use crate::router::Router;
use aes::Aes128;
use ctr::cipher::{KeyIvInit, StreamCipher};
use ctr::Ctr128BE;
use num_bigint::{BigUint, RandBigInt};
use num_traits::One;
use once_cell::sync::Lazy;
use sha1::{Digest, Sha1};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// AES-128-CTR keystream (big-endian 128-bit counter, zero IV)
type Aes128Ctr = Ctr128BE<Aes128>;

/// DH public values are always exactly 128 bytes, big-endian,
/// left-zero-padded.
pub const DH_PUBLIC_LEN: usize = 128;

/// Length of the KH handshake confirmation
pub const KH_LEN: usize = 20;

/// Length of a CREATED/EXTENDED payload: Y (128) || KH (20)
pub const HANDSHAKE_REPLY_LEN: usize = DH_PUBLIC_LEN + KH_LEN;

/// Fixed 1024-bit group modulus (RFC 2409 Oakley group 2)
static DH_MODULUS: Lazy<BigUint> = Lazy::new(|| {
    BigUint::parse_bytes(
        b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD129024E088A67CC74\
          020BBEA63B139B22514A08798E3404DDEF9519B3CD3A431B302B0A6DF25F1437\
          4FE1356D6D51C245E485B576625E7EC6F44C42E9A637ED6B0BFF5CB6F406B7ED\
          EE386BFB5A899FA5AE9F24117C4B1FE649286651ECE65381FFFFFFFFFFFFFFFF",
        16,
    )
    .expect("fixed modulus parses")
});

/// Fixed group generator
static DH_GENERATOR: Lazy<BigUint> = Lazy::new(|| BigUint::from(2u8));

/// Role of a node within the handshake (decides key-half assignment)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeRole {
    /// Circuit originator
    Client,
    /// Responder (also used by the in-process test relays)
    Server,
}

/// Derived key material for one hop
///
/// SECURITY: zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyMaterial {
    /// Handshake confirmation (first 20 bytes of the stretch)
    pub kh: [u8; 20],

    /// Seed pre-fed into the forward running digest
    pub forward_digest_seed: [u8; 20],

    /// Seed pre-fed into the backward running digest
    pub backward_digest_seed: [u8; 20],

    /// AES-128 key for the forward keystream
    pub forward_key: [u8; 16],

    /// AES-128 key for the backward keystream
    pub backward_key: [u8; 16],
}

impl KeyMaterial {
    /// Stretch the canonical 128-byte shared secret to 100 bytes and split
    /// per role. The KH confirmation is checked by the caller.
    fn derive(secret: &[u8; DH_PUBLIC_LEN], role: NodeRole) -> Self {
        let mut stretched = [0u8; 100];
        for i in 0..5u8 {
            let mut hasher = Sha1::new();
            hasher.update(secret);
            hasher.update([i]);
            let block = hasher.finalize();
            stretched[i as usize * 20..(i as usize + 1) * 20].copy_from_slice(&block);
        }

        let mut kh = [0u8; 20];
        kh.copy_from_slice(&stretched[0..20]);

        let mut seed_a = [0u8; 20];
        let mut seed_b = [0u8; 20];
        seed_a.copy_from_slice(&stretched[20..40]);
        seed_b.copy_from_slice(&stretched[40..60]);

        let mut key_a = [0u8; 16];
        let mut key_b = [0u8; 16];
        key_a.copy_from_slice(&stretched[60..76]);
        key_b.copy_from_slice(&stretched[76..92]);

        stretched.zeroize();

        // The stretch is direction-agnostic; the role decides which half is
        // "forward" from this node's point of view.
        match role {
            NodeRole::Client => Self {
                kh,
                forward_digest_seed: seed_a,
                backward_digest_seed: seed_b,
                forward_key: key_a,
                backward_key: key_b,
            },
            NodeRole::Server => Self {
                kh,
                forward_digest_seed: seed_b,
                backward_digest_seed: seed_a,
                forward_key: key_b,
                backward_key: key_a,
            },
        }
    }
}

/// Live per-hop cipher and digest state, built from `KeyMaterial` once the
/// handshake completes. All fields advance strictly in cell order.
struct HopCrypto {
    material: KeyMaterial,
    forward_digest: Sha1,
    backward_digest: Sha1,
    forward_cipher: Aes128Ctr,
    backward_cipher: Aes128Ctr,
}

impl HopCrypto {
    fn new(material: KeyMaterial) -> Self {
        let mut forward_digest = Sha1::new();
        forward_digest.update(material.forward_digest_seed);

        let mut backward_digest = Sha1::new();
        backward_digest.update(material.backward_digest_seed);

        // Counter starts at zero for both keystreams
        let zero_iv = [0u8; 16];
        let forward_cipher = Aes128Ctr::new((&material.forward_key).into(), (&zero_iv).into());
        let backward_cipher = Aes128Ctr::new((&material.backward_key).into(), (&zero_iv).into());

        Self {
            material,
            forward_digest,
            backward_digest,
            forward_cipher,
            backward_cipher,
        }
    }
}

/// Ephemeral DH keypair held until the peer's half arrives
struct DhEphemeral {
    private: BigUint,
}

/// One hop's established cryptographic state within a circuit.
///
/// Lifecycle: `Uninitialized -> AwaitingPeerHalf -> Established`. Key
/// fields are immutable after `finish_dh`; only the running digest and
/// keystream state advances.
pub struct Node {
    /// The router this hop runs through
    pub router: Router,

    role: NodeRole,

    /// Our public value, fixed 128 bytes big-endian left-zero-padded
    dh_public: [u8; DH_PUBLIC_LEN],

    /// Private exponent, dropped once the handshake completes
    ephemeral: Option<DhEphemeral>,

    crypto: Option<HopCrypto>,
}

impl Node {
    /// Client-role construction: generate an ephemeral keypair and move to
    /// `AwaitingPeerHalf`.
    pub fn client(router: Router) -> Self {
        let private = rand::thread_rng().gen_biguint_range(&BigUint::from(2u8), &DH_MODULUS);
        Self::client_with_private(router, private)
    }

    /// Client-role construction with a caller-supplied private exponent.
    /// Deterministic handshakes for tests; production code uses `client`.
    pub fn client_with_private(router: Router, private: BigUint) -> Self {
        let public = DH_GENERATOR.modpow(&private, &DH_MODULUS);
        Self {
            router,
            role: NodeRole::Client,
            dh_public: canonicalize(&public),
            ephemeral: Some(DhEphemeral { private }),
            crypto: None,
        }
    }

    /// Server-role construction: answer a peer's public value in one step.
    ///
    /// Returns the established node together with the `Y || KH` reply
    /// payload for the CREATED/EXTENDED cell. Also the backbone of the mock
    /// relay chain used in the integration tests.
    pub fn respond(router: Router, peer_public: &[u8]) -> Result<(Self, [u8; HANDSHAKE_REPLY_LEN])> {
        let private = rand::thread_rng().gen_biguint_range(&BigUint::from(2u8), &DH_MODULUS);
        Self::respond_with_private(router, peer_public, private)
    }

    /// Server-role construction with a caller-supplied private exponent.
    pub fn respond_with_private(
        router: Router,
        peer_public: &[u8],
        private: BigUint,
    ) -> Result<(Self, [u8; HANDSHAKE_REPLY_LEN])> {
        let public = DH_GENERATOR.modpow(&private, &DH_MODULUS);
        let secret = shared_secret(&private, peer_public)?;
        let material = KeyMaterial::derive(&secret, NodeRole::Server);

        let mut reply = [0u8; HANDSHAKE_REPLY_LEN];
        reply[..DH_PUBLIC_LEN].copy_from_slice(&canonicalize(&public));
        reply[DH_PUBLIC_LEN..].copy_from_slice(&material.kh);

        let node = Self {
            router,
            role: NodeRole::Server,
            dh_public: canonicalize(&public),
            ephemeral: None,
            crypto: Some(HopCrypto::new(material)),
        };

        Ok((node, reply))
    }

    /// Our public value for the CREATE/EXTEND onion skin
    pub fn dh_public(&self) -> &[u8; DH_PUBLIC_LEN] {
        &self.dh_public
    }

    /// Whether `finish_dh` has completed for this hop
    pub fn is_established(&self) -> bool {
        self.crypto.is_some()
    }

    pub fn role(&self) -> NodeRole {
        self.role
    }

    /// Derived key material (established hops only)
    pub fn key_material(&self) -> Option<&KeyMaterial> {
        self.crypto.as_ref().map(|c| &c.material)
    }

    /// Finalize the hop with the peer's public value and KH confirmation.
    ///
    /// The KH comparison is the only authentication of the exchange; a
    /// mismatch fails the hop with `KeyDerivationMismatch`. After success
    /// all key fields are immutable for the node's lifetime.
    pub fn finish_dh(&mut self, peer_public: &[u8], kh: &[u8]) -> Result<()> {
        if self.crypto.is_some() {
            return Err(TorError::HandshakeFailed("hop already established".into()));
        }
        let ephemeral = self
            .ephemeral
            .take()
            .ok_or_else(|| TorError::HandshakeFailed("no ephemeral keypair".into()))?;
        if kh.len() != KH_LEN {
            return Err(TorError::HandshakeFailed(format!(
                "KH must be {} bytes, got {}",
                KH_LEN,
                kh.len()
            )));
        }

        let secret = shared_secret(&ephemeral.private, peer_public)?;
        let material = KeyMaterial::derive(&secret, self.role);

        if material.kh.ct_eq(kh).unwrap_u8() != 1 {
            return Err(TorError::KeyDerivationMismatch);
        }

        log::debug!(
            "hop {} established (kh {})",
            self.router.nickname,
            hex::encode(&material.kh[..4])
        );

        self.crypto = Some(HopCrypto::new(material));
        Ok(())
    }

    fn crypto_mut(&mut self) -> Result<&mut HopCrypto> {
        self.crypto
            .as_mut()
            .ok_or_else(|| TorError::HandshakeFailed("hop not established".into()))
    }

    // The four primitives below are symmetric across roles: because the
    // server derives its halves swapped, a server node sends with
    // `encrypt_forward`/`forward_digest` and verifies inbound client cells
    // with `decrypt_backward`/`check_backward_digest`, exactly like the
    // client does for the opposite direction.

    /// Apply one layer of the forward keystream in place
    pub fn encrypt_forward(&mut self, data: &mut [u8]) -> Result<()> {
        self.crypto_mut()?.forward_cipher.apply_keystream(data);
        Ok(())
    }

    /// Remove one layer of the backward keystream in place.
    /// CTR is symmetric, so this is the same XOR as encryption — but the
    /// backward keystream must never be mixed with the forward one.
    pub fn decrypt_backward(&mut self, data: &mut [u8]) -> Result<()> {
        self.crypto_mut()?.backward_cipher.apply_keystream(data);
        Ok(())
    }

    /// Advance the forward running digest with `payload` and return the
    /// 4-byte truncation.
    ///
    /// Destructive by design: every byte ever sent forward contributes
    /// permanently to the digest chain, which is why encode order must
    /// match transmission order exactly.
    pub fn forward_digest(&mut self, payload: &[u8]) -> Result<[u8; 4]> {
        let crypto = self.crypto_mut()?;
        crypto.forward_digest.update(payload);
        let full = crypto.forward_digest.clone().finalize();
        let mut digest = [0u8; 4];
        digest.copy_from_slice(&full[..4]);
        Ok(digest)
    }

    /// Trial-check `expected` against the backward running digest fed with
    /// `payload` (digest field already zeroed by the caller).
    ///
    /// The accumulator is cloned for the trial and committed only on a
    /// match, so a failed candidate hop leaves the state untouched for the
    /// next layer.
    pub fn check_backward_digest(&mut self, payload: &[u8], expected: &[u8; 4]) -> Result<bool> {
        let crypto = self.crypto_mut()?;

        let mut trial = crypto.backward_digest.clone();
        trial.update(payload);
        let full = trial.clone().finalize();

        if full[..4].ct_eq(expected).unwrap_u8() == 1 {
            crypto.backward_digest = trial;
            Ok(true)
        } else {
            Ok(false)
        }
    }

}

/// Canonicalize a group element to 128 bytes big-endian, left-zero-padded
fn canonicalize(value: &BigUint) -> [u8; DH_PUBLIC_LEN] {
    let bytes = value.to_bytes_be();
    let mut out = [0u8; DH_PUBLIC_LEN];
    out[DH_PUBLIC_LEN - bytes.len()..].copy_from_slice(&bytes);
    out
}

/// Compute and canonicalize the shared secret, rejecting degenerate peer
/// values (0, 1, p-1 and out-of-range encodings).
fn shared_secret(private: &BigUint, peer_public: &[u8]) -> Result<[u8; DH_PUBLIC_LEN]> {
    if peer_public.len() != DH_PUBLIC_LEN {
        return Err(TorError::HandshakeFailed(format!(
            "DH public value must be {} bytes, got {}",
            DH_PUBLIC_LEN,
            peer_public.len()
        )));
    }

    let peer = BigUint::from_bytes_be(peer_public);
    let one = BigUint::one();
    if peer <= one || peer >= &*DH_MODULUS - &one {
        return Err(TorError::HandshakeFailed(
            "degenerate DH public value".into(),
        ));
    }

    Ok(canonicalize(&peer.modpow(private, &DH_MODULUS)))
}

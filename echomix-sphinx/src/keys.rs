//! Group primitives and per-hop key derivation.
//!
//! The abstract prime-order group is Curve25519 in its Montgomery form. The
//! raw `MontgomeryPoint`/`Scalar` pair is used instead of the x25519 API:
//! x25519 clamps its scalar on every multiplication, which breaks the
//! accumulated blinding algebra the header depends on (`α·b₀·b₁·…` must
//! equal multiplication by the product of the unclamped scalars).

use curve25519_dalek::constants::X25519_BASEPOINT;
use hkdf::Hkdf;

pub use curve25519_dalek::montgomery::MontgomeryPoint;
pub use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::Sha256;

use crate::header::{ROUTING_INFO_SIZE, ROUTING_SLOT_SIZE};
use crate::{Result, SphinxError};

/// Serialized width of a group element.
pub const POINT_SIZE: usize = 32;

/// The group generator.
pub fn base_point() -> MontgomeryPoint {
    X25519_BASEPOINT
}

/// Draw a uniformly random scalar from `rng`.
pub fn random_scalar<R: RngCore + CryptoRng>(rng: &mut R) -> Scalar {
    let mut wide = [0u8; 64];
    rng.fill_bytes(&mut wide);
    Scalar::from_bytes_mod_order_wide(&wide)
}

/// Canonical encodings of Curve25519's low-order points. The unclamped
/// ladder would confine the shared secret to the small subgroup for any of
/// these, so they are rejected outright.
const LOW_ORDER_POINTS: [[u8; POINT_SIZE]; 7] = [
    // u = 0: the order-2 point, and the neutral element's ladder image
    [
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ],
    // u = 1: order 4
    [
        0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
        0x00, 0x00, 0x00, 0x00,
    ],
    // order 8
    [
        0xe0, 0xeb, 0x7a, 0x7c, 0x3b, 0x41, 0xb8, 0xae, 0x16, 0x56, 0xe3, 0xfa, 0xf1, 0x9f,
        0xc4, 0x6a, 0xda, 0x09, 0x8d, 0xeb, 0x9c, 0x32, 0xb1, 0xfd, 0x86, 0x62, 0x05, 0x16,
        0x5f, 0x49, 0xb8, 0x00,
    ],
    // order 8
    [
        0x5f, 0x9c, 0x95, 0xbc, 0xa3, 0x50, 0x8c, 0x24, 0xb1, 0xd0, 0xb1, 0x55, 0x9c, 0x83,
        0xef, 0x5b, 0x04, 0x44, 0x5c, 0xc4, 0x58, 0x1c, 0x8e, 0x86, 0xd8, 0x22, 0x4e, 0xdd,
        0xd0, 0x9f, 0x11, 0x57,
    ],
    // p - 1: order 2
    [
        0xec, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0x7f,
    ],
    // p: reduces to u = 0
    [
        0xed, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0x7f,
    ],
    // p + 1: reduces to u = 1
    [
        0xee, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff,
        0xff, 0xff, 0xff, 0x7f,
    ],
];

/// Parse a serialized group element, rejecting the identity and the other
/// known low-order points.
pub fn point_from_bytes(bytes: &[u8]) -> Result<MontgomeryPoint> {
    let array: [u8; POINT_SIZE] = bytes.try_into().map_err(|_| SphinxError::BadPoint)?;
    // The field decode ignores bit 255, so every low-order encoding has a
    // high-bit alias; clear it before matching.
    let mut canonical = array;
    canonical[POINT_SIZE - 1] &= 0x7F;
    if LOW_ORDER_POINTS.contains(&canonical) {
        return Err(SphinxError::BadPoint);
    }
    Ok(MontgomeryPoint(canonical))
}

/// A long-term or ephemeral Curve25519 key pair.
#[derive(Clone)]
pub struct KeyPair {
    secret: Scalar,
    public: MontgomeryPoint,
}

impl KeyPair {
    /// Generate a fresh key pair.
    pub fn generate<R: RngCore + CryptoRng>(rng: &mut R) -> Self {
        let secret = random_scalar(rng);
        Self {
            public: base_point() * secret,
            secret,
        }
    }

    /// Reconstruct a key pair from stored secret bytes.
    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        let secret = Scalar::from_bytes_mod_order(bytes);
        Self {
            public: base_point() * secret,
            secret,
        }
    }

    /// The private scalar.
    pub fn secret(&self) -> &Scalar {
        &self.secret
    }

    /// The public point.
    pub fn public(&self) -> &MontgomeryPoint {
        &self.public
    }

    /// Serialized public point, as published through the PKI.
    pub fn public_bytes(&self) -> [u8; 32] {
        self.public.to_bytes()
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public", &self.public_bytes())
            .finish_non_exhaustive()
    }
}

/// The set of symmetric keys a single hop derives from its shared secret.
pub(crate) struct HopKeys {
    /// Blinding scalar applied to α before forwarding.
    pub(crate) blinding: Scalar,
    routing_key: [u8; 32],
    routing_iv: [u8; 12],
    mac_key: [u8; 32],
    payload_key: [u8; 32],
    payload_iv: [u8; 12],
}

impl HopKeys {
    /// Keystream that covers β extended by one routing slot.
    pub(crate) fn routing_keystream(&self) -> [u8; ROUTING_INFO_SIZE + ROUTING_SLOT_SIZE] {
        let mut stream = [0u8; ROUTING_INFO_SIZE + ROUTING_SLOT_SIZE];
        apply_chacha(&self.routing_key, &self.routing_iv, &mut stream);
        stream
    }

    /// XOR the payload keystream over `payload` in place.
    pub(crate) fn apply_payload(&self, payload: &mut [u8]) {
        apply_chacha(&self.payload_key, &self.payload_iv, payload);
    }

    /// Truncated HMAC-SHA256 over β.
    pub(crate) fn mac(&self, routing_info: &[u8]) -> [u8; crate::header::MAC_SIZE] {
        use hmac::{Hmac, Mac};
        let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(&self.mac_key)
            .expect("HMAC accepts any key length");
        mac.update(routing_info);
        let digest = mac.finalize().into_bytes();
        let mut out = [0u8; crate::header::MAC_SIZE];
        out.copy_from_slice(&digest[..crate::header::MAC_SIZE]);
        out
    }
}

fn apply_chacha(key: &[u8; 32], iv: &[u8; 12], buf: &mut [u8]) {
    use chacha20::cipher::{KeyIvInit, StreamCipher};
    let mut cipher = chacha20::ChaCha20::new(key.into(), iv.into());
    cipher.apply_keystream(buf);
}

/// Derive the per-hop key set from the hop's ephemeral point and shared
/// secret. Both sides compute the same values: the sender from its
/// accumulated exponent, the hop from `α^x`.
pub(crate) fn derive_hop_keys(alpha: &MontgomeryPoint, shared: &MontgomeryPoint) -> HopKeys {
    let hk = Hkdf::<Sha256>::new(Some(alpha.as_bytes()), shared.as_bytes());

    let mut wide = [0u8; 64];
    hk.expand(b"echomix-blinding", &mut wide)
        .expect("HKDF expand failed");
    let blinding = Scalar::from_bytes_mod_order_wide(&wide);

    let mut routing_key = [0u8; 32];
    let mut routing_iv = [0u8; 12];
    let mut mac_key = [0u8; 32];
    let mut payload_key = [0u8; 32];
    let mut payload_iv = [0u8; 12];
    hk.expand(b"echomix-routing-key", &mut routing_key)
        .expect("HKDF expand failed");
    hk.expand(b"echomix-routing-iv", &mut routing_iv)
        .expect("HKDF expand failed");
    hk.expand(b"echomix-mac-key", &mut mac_key)
        .expect("HKDF expand failed");
    hk.expand(b"echomix-payload-key", &mut payload_key)
        .expect("HKDF expand failed");
    hk.expand(b"echomix-payload-iv", &mut payload_iv)
        .expect("HKDF expand failed");

    HopKeys {
        blinding,
        routing_key,
        routing_iv,
        mac_key,
        payload_key,
        payload_iv,
    }
}

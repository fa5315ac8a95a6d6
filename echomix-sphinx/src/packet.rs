//! Sphinx packet construction and single-layer unwrapping.

use std::net::SocketAddr;

use curve25519_dalek::montgomery::MontgomeryPoint;
use curve25519_dalek::scalar::Scalar;
use rand::{CryptoRng, RngCore};
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::header::{
    decode_slot, encode_slot, FINAL_FLAG, MAC_SIZE, MAX_HOPS, RELAY_FLAG, ROUTING_INFO_SIZE,
    ROUTING_SLOT_SIZE,
};
use crate::keys::{self, HopKeys, POINT_SIZE};
use crate::{Result, SphinxError};

/// Fixed payload width; plaintext is framed as `len:u16 LE ‖ data ‖ zero pad`.
pub const PAYLOAD_SIZE: usize = 2048;

/// Total packet width, invariant across hops.
pub const PACKET_SIZE: usize = POINT_SIZE + ROUTING_INFO_SIZE + MAC_SIZE + PAYLOAD_SIZE;

/// Width reserved for the payload length prefix.
const PAYLOAD_PREFIX: usize = 2;

/// One hop of a path as the sender sees it: the node that peels this layer,
/// where that node forwards, and how long it waits first.
#[derive(Debug, Clone)]
pub struct Hop {
    /// Public key of the node processing this layer.
    pub public_key: MontgomeryPoint,
    /// Where the node forwards next: a socket address for relay hops, the
    /// recipient's client id for the final hop.
    pub next: String,
    /// `RELAY_FLAG` or `FINAL_FLAG`.
    pub flag: u8,
    /// Forwarding delay in milliseconds, drawn by the sender.
    pub delay_ms: u32,
}

/// A layered onion packet.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SphinxPacket {
    /// Ephemeral group element for this hop.
    pub alpha: [u8; POINT_SIZE],
    /// Encrypted routing information, constant width.
    pub routing_info: Vec<u8>,
    /// Truncated MAC over `routing_info`.
    pub mac: [u8; MAC_SIZE],
    /// Layered payload ciphertext, constant width.
    pub payload: Vec<u8>,
}

/// What a hop learned from one unwrap.
#[derive(Debug)]
pub struct UnwrapResult {
    /// Hash of the hop's α; a mix drops packets whose tag it has seen.
    pub replay_tag: [u8; 32],
    /// What to do with the packet next.
    pub action: RoutingAction,
}

/// Routing decision recovered from the hop's slot.
#[derive(Debug)]
pub enum RoutingAction {
    /// Wait `delay_ms`, then forward `packet` to `next_address`.
    Relay {
        /// Address of the next hop.
        next_address: SocketAddr,
        /// Forwarding delay in milliseconds.
        delay_ms: u32,
        /// The packet to forward, one layer removed.
        packet: Box<SphinxPacket>,
    },
    /// Final hop: hand `payload` to the provider store for `recipient_id`.
    Deliver {
        /// Inbox owner the payload is addressed to.
        recipient_id: String,
        /// Delay before the store step, in milliseconds.
        delay_ms: u32,
        /// Recovered plaintext.
        payload: Vec<u8>,
    },
}

impl SphinxPacket {
    /// Wrap `message` into an onion over `hops`.
    ///
    /// The sender derives every hop's shared secret up front by accumulating
    /// the blinding scalars, builds β back to front so that each hop's slot
    /// sits under exactly the right layers, and applies the payload
    /// keystreams in reverse order.
    pub fn build<R: RngCore + CryptoRng>(
        rng: &mut R,
        message: &[u8],
        hops: &[Hop],
    ) -> Result<Self> {
        if hops.is_empty() {
            return Err(SphinxError::EmptyPath);
        }
        if hops.len() > MAX_HOPS {
            return Err(SphinxError::TooManyHops(hops.len()));
        }
        if message.len() > PAYLOAD_SIZE - PAYLOAD_PREFIX {
            return Err(SphinxError::PayloadTooLarge(message.len()));
        }

        // Shared secrets: sᵢ = pkᵢ^(x·b₀·…·bᵢ₋₁); αᵢ follows the same chain.
        let ephemeral = keys::random_scalar(rng);
        let first_alpha = keys::base_point() * ephemeral;
        let mut alpha = first_alpha;
        let mut exponent = ephemeral;
        let mut hop_keys: Vec<HopKeys> = Vec::with_capacity(hops.len());
        for hop in hops {
            let shared = hop.public_key * exponent;
            if shared == MontgomeryPoint([0u8; POINT_SIZE]) {
                return Err(SphinxError::BadPoint);
            }
            let derived = keys::derive_hop_keys(&alpha, &shared);
            exponent *= derived.blinding;
            alpha = alpha * derived.blinding;
            hop_keys.push(derived);
        }

        let streams: Vec<_> = hop_keys.iter().map(HopKeys::routing_keystream).collect();

        // Filler: the tail of β grows by one keystream-determined slot per
        // hop; the sender must reproduce those bytes so the last hop's MAC
        // verifies.
        let last = hops.len() - 1;
        let mut filler: Vec<u8> = Vec::new();
        for stream in streams.iter().take(last) {
            filler.extend_from_slice(&[0u8; ROUTING_SLOT_SIZE]);
            let tail = &stream[ROUTING_INFO_SIZE + ROUTING_SLOT_SIZE - filler.len()..];
            for (f, s) in filler.iter_mut().zip(tail) {
                *f ^= s;
            }
        }

        // β for the last hop: its slot, random padding, then the filler.
        let content_len = ROUTING_INFO_SIZE - filler.len();
        let slot = encode_slot(
            &hops[last].next,
            hops[last].flag,
            hops[last].delay_ms,
            &[0u8; MAC_SIZE],
        )?;
        let mut beta = vec![0u8; ROUTING_INFO_SIZE];
        beta[..ROUTING_SLOT_SIZE].copy_from_slice(&slot);
        rng.fill_bytes(&mut beta[ROUTING_SLOT_SIZE..content_len]);
        for (b, s) in beta[..content_len].iter_mut().zip(&streams[last][..]) {
            *b ^= s;
        }
        beta[content_len..].copy_from_slice(&filler);
        let mut gamma = hop_keys[last].mac(&beta);

        // Earlier hops, back to front: prepend the slot, truncate, encrypt.
        for i in (0..last).rev() {
            let slot = encode_slot(&hops[i].next, hops[i].flag, hops[i].delay_ms, &gamma)?;
            let mut wrapped = vec![0u8; ROUTING_INFO_SIZE];
            wrapped[..ROUTING_SLOT_SIZE].copy_from_slice(&slot);
            wrapped[ROUTING_SLOT_SIZE..]
                .copy_from_slice(&beta[..ROUTING_INFO_SIZE - ROUTING_SLOT_SIZE]);
            for (b, s) in wrapped.iter_mut().zip(&streams[i][..ROUTING_INFO_SIZE]) {
                *b ^= s;
            }
            beta = wrapped;
            gamma = hop_keys[i].mac(&beta);
        }

        // Payload: length framing, then keystream layers innermost first.
        let mut payload = vec![0u8; PAYLOAD_SIZE];
        payload[..PAYLOAD_PREFIX].copy_from_slice(&(message.len() as u16).to_le_bytes());
        payload[PAYLOAD_PREFIX..PAYLOAD_PREFIX + message.len()].copy_from_slice(message);
        for derived in hop_keys.iter().rev() {
            derived.apply_payload(&mut payload);
        }

        Ok(Self {
            alpha: first_alpha.to_bytes(),
            routing_info: beta,
            mac: gamma,
            payload,
        })
    }

    /// Peel one layer with this node's private scalar.
    ///
    /// Verifies γ before touching anything else, then recovers the routing
    /// slot, re-blinds α, and strips one payload layer.
    pub fn unwrap(&self, secret: &Scalar) -> Result<UnwrapResult> {
        let alpha = keys::point_from_bytes(&self.alpha)?;
        let shared = alpha * secret;
        if shared == MontgomeryPoint([0u8; POINT_SIZE]) {
            return Err(SphinxError::BadPoint);
        }
        let derived = keys::derive_hop_keys(&alpha, &shared);

        let expected = derived.mac(&self.routing_info);
        if !bool::from(expected.ct_eq(&self.mac)) {
            return Err(SphinxError::BadMac);
        }

        let replay_tag: [u8; 32] = Sha256::digest(self.alpha).into();

        // Extend β by one zero slot, decrypt, and split off our slot. The
        // tail the next hop sees is keystream where the zeros were, so its
        // β is as wide as ours.
        let mut extended = [0u8; ROUTING_INFO_SIZE + ROUTING_SLOT_SIZE];
        extended[..ROUTING_INFO_SIZE].copy_from_slice(&self.routing_info);
        let stream = derived.routing_keystream();
        for (b, s) in extended.iter_mut().zip(&stream[..]) {
            *b ^= s;
        }
        let slot = decode_slot(&extended[..ROUTING_SLOT_SIZE])?;

        let mut payload = self.payload.clone();
        derived.apply_payload(&mut payload);

        match slot.flag {
            RELAY_FLAG => {
                let next_address: SocketAddr = slot
                    .dest
                    .parse()
                    .map_err(|_| SphinxError::BadRouting(slot.dest.clone()))?;
                let next_alpha = alpha * derived.blinding;
                let packet = SphinxPacket {
                    alpha: next_alpha.to_bytes(),
                    routing_info: extended[ROUTING_SLOT_SIZE..].to_vec(),
                    mac: slot.next_mac,
                    payload,
                };
                Ok(UnwrapResult {
                    replay_tag,
                    action: RoutingAction::Relay {
                        next_address,
                        delay_ms: slot.delay_ms,
                        packet: Box::new(packet),
                    },
                })
            }
            FINAL_FLAG => {
                let len = u16::from_le_bytes(
                    payload[..PAYLOAD_PREFIX]
                        .try_into()
                        .expect("payload width is fixed"),
                ) as usize;
                if len > PAYLOAD_SIZE - PAYLOAD_PREFIX {
                    return Err(SphinxError::BadPayload);
                }
                Ok(UnwrapResult {
                    replay_tag,
                    action: RoutingAction::Deliver {
                        recipient_id: slot.dest,
                        delay_ms: slot.delay_ms,
                        payload: payload[PAYLOAD_PREFIX..PAYLOAD_PREFIX + len].to_vec(),
                    },
                })
            }
            other => Err(SphinxError::BadFlag(other)),
        }
    }

    /// Serialize as `α ‖ β ‖ γ ‖ payload`.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(PACKET_SIZE);
        bytes.extend_from_slice(&self.alpha);
        bytes.extend_from_slice(&self.routing_info);
        bytes.extend_from_slice(&self.mac);
        bytes.extend_from_slice(&self.payload);
        bytes
    }

    /// Parse a packet, requiring the exact hop-invariant width.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != PACKET_SIZE {
            return Err(SphinxError::BadLength(bytes.len()));
        }
        let mut alpha = [0u8; POINT_SIZE];
        alpha.copy_from_slice(&bytes[..POINT_SIZE]);
        let routing_info = bytes[POINT_SIZE..POINT_SIZE + ROUTING_INFO_SIZE].to_vec();
        let mut mac = [0u8; MAC_SIZE];
        mac.copy_from_slice(
            &bytes[POINT_SIZE + ROUTING_INFO_SIZE..POINT_SIZE + ROUTING_INFO_SIZE + MAC_SIZE],
        );
        let payload = bytes[POINT_SIZE + ROUTING_INFO_SIZE + MAC_SIZE..].to_vec();
        Ok(Self {
            alpha,
            routing_info,
            mac,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyPair;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn make_path(rng: &mut StdRng, relays: usize) -> (Vec<KeyPair>, Vec<Hop>) {
        let keys: Vec<KeyPair> = (0..relays + 1).map(|_| KeyPair::generate(rng)).collect();
        let mut hops: Vec<Hop> = (0..relays)
            .map(|i| Hop {
                public_key: *keys[i].public(),
                next: format!("127.0.0.1:{}", 9000 + i as u16 + 1),
                flag: RELAY_FLAG,
                delay_ms: (i as u32 + 1) * 10,
            })
            .collect();
        hops.push(Hop {
            public_key: *keys[relays].public(),
            next: "recipient-1".to_string(),
            flag: FINAL_FLAG,
            delay_ms: 5,
        });
        (keys, hops)
    }

    fn unwrap_chain(packet: SphinxPacket, keys: &[KeyPair], hops: &[Hop]) -> Vec<u8> {
        let mut current = packet;
        for (i, key) in keys.iter().enumerate() {
            let result = current.unwrap(key.secret()).unwrap();
            match result.action {
                RoutingAction::Relay {
                    next_address,
                    delay_ms,
                    packet,
                } => {
                    assert!(i + 1 < keys.len(), "relay at final hop");
                    assert_eq!(next_address.to_string(), hops[i].next);
                    assert_eq!(delay_ms, hops[i].delay_ms);
                    assert_eq!(packet.to_bytes().len(), PACKET_SIZE);
                    current = *packet;
                }
                RoutingAction::Deliver {
                    recipient_id,
                    delay_ms,
                    payload,
                } => {
                    assert_eq!(i, keys.len() - 1, "deliver before final hop");
                    assert_eq!(recipient_id, hops[i].next);
                    assert_eq!(delay_ms, hops[i].delay_ms);
                    return payload;
                }
            }
        }
        unreachable!("chain ended without delivery")
    }

    #[test]
    fn roundtrip_across_all_path_lengths() {
        let mut rng = StdRng::seed_from_u64(42);
        for relays in 0..MAX_HOPS {
            let (keys, hops) = make_path(&mut rng, relays);
            let message = format!("message across {} hops", relays + 1);
            let packet = SphinxPacket::build(&mut rng, message.as_bytes(), &hops).unwrap();
            let delivered = unwrap_chain(packet, &keys, &hops);
            assert_eq!(delivered, message.as_bytes());
        }
    }

    #[test]
    fn packet_length_is_hop_invariant() {
        let mut rng = StdRng::seed_from_u64(43);
        let (keys, hops) = make_path(&mut rng, 3);
        let packet = SphinxPacket::build(&mut rng, b"constant width", &hops).unwrap();
        assert_eq!(packet.to_bytes().len(), PACKET_SIZE);

        let mut current = packet;
        for key in &keys[..3] {
            match current.unwrap(key.secret()).unwrap().action {
                RoutingAction::Relay { packet, .. } => {
                    assert_eq!(packet.to_bytes().len(), PACKET_SIZE);
                    current = *packet;
                }
                RoutingAction::Deliver { .. } => panic!("unexpected delivery"),
            }
        }
    }

    #[test]
    fn bit_flip_in_routing_info_fails_mac() {
        let mut rng = StdRng::seed_from_u64(44);
        let (keys, hops) = make_path(&mut rng, 2);
        let mut packet = SphinxPacket::build(&mut rng, b"tamper", &hops).unwrap();
        packet.routing_info[17] ^= 0x01;
        assert!(matches!(
            packet.unwrap(keys[0].secret()),
            Err(SphinxError::BadMac)
        ));
    }

    #[test]
    fn wrong_key_fails_mac() {
        let mut rng = StdRng::seed_from_u64(45);
        let (_, hops) = make_path(&mut rng, 2);
        let stranger = KeyPair::generate(&mut rng);
        let packet = SphinxPacket::build(&mut rng, b"misdelivered", &hops).unwrap();
        assert!(matches!(
            packet.unwrap(stranger.secret()),
            Err(SphinxError::BadMac)
        ));
    }

    #[test]
    fn build_rejects_bad_paths() {
        let mut rng = StdRng::seed_from_u64(46);
        assert!(matches!(
            SphinxPacket::build(&mut rng, b"m", &[]),
            Err(SphinxError::EmptyPath)
        ));

        let (_, hops) = make_path(&mut rng, MAX_HOPS);
        assert!(matches!(
            SphinxPacket::build(&mut rng, b"m", &hops),
            Err(SphinxError::TooManyHops(_))
        ));

        let (_, hops) = make_path(&mut rng, 1);
        let oversized = vec![0u8; PAYLOAD_SIZE];
        assert!(matches!(
            SphinxPacket::build(&mut rng, &oversized, &hops),
            Err(SphinxError::PayloadTooLarge(_))
        ));
    }

    #[test]
    fn from_bytes_rejects_wrong_width() {
        assert!(matches!(
            SphinxPacket::from_bytes(&[0u8; 100]),
            Err(SphinxError::BadLength(100))
        ));
    }

    #[test]
    fn serialization_roundtrip() {
        let mut rng = StdRng::seed_from_u64(47);
        let (_, hops) = make_path(&mut rng, 2);
        let packet = SphinxPacket::build(&mut rng, b"wire format", &hops).unwrap();
        let parsed = SphinxPacket::from_bytes(&packet.to_bytes()).unwrap();
        assert_eq!(parsed, packet);
    }

    #[test]
    fn corrupt_alpha_is_rejected_before_mac() {
        let mut rng = StdRng::seed_from_u64(48);
        let (keys, hops) = make_path(&mut rng, 1);
        let mut packet = SphinxPacket::build(&mut rng, b"zeroed", &hops).unwrap();
        packet.alpha = [0u8; POINT_SIZE];
        assert!(matches!(
            packet.unwrap(keys[0].secret()),
            Err(SphinxError::BadPoint)
        ));
    }
}

//! Routing slot codec for the encrypted β block.
//!
//! β is a constant-width stack of per-hop slots. Each slot names where the
//! hop forwards next, the hop flag, the forwarding delay, and the MAC the
//! next hop will verify:
//!
//! ```text
//! addr_len : u8 ‖ addr : MAX_ADDR_SIZE bytes (zero padded)
//!          ‖ flag : u8 ‖ delay_ms : u32 LE ‖ γ_next : MAC_SIZE bytes
//! ```
//!
//! Relay slots carry a socket address; the final slot carries the recipient's
//! client id in the same field.

use crate::{Result, SphinxError};

/// Hop flag: unwrap, delay, and forward to the next node.
pub const RELAY_FLAG: u8 = 0xF1;

/// Hop flag: final hop; deliver the payload into the recipient's inbox.
pub const FINAL_FLAG: u8 = 0xF0;

/// Width of the truncated header MAC.
pub const MAC_SIZE: usize = 16;

/// Maximum serialized width of a next-hop address or recipient id.
pub const MAX_ADDR_SIZE: usize = 40;

/// Maximum number of hops a header can route through.
pub const MAX_HOPS: usize = 5;

/// Width of one per-hop routing slot.
pub const ROUTING_SLOT_SIZE: usize = 1 + MAX_ADDR_SIZE + 1 + 4 + MAC_SIZE;

/// Constant width of β at every hop.
pub const ROUTING_INFO_SIZE: usize = ROUTING_SLOT_SIZE * MAX_HOPS;

const FLAG_OFFSET: usize = 1 + MAX_ADDR_SIZE;
const DELAY_OFFSET: usize = FLAG_OFFSET + 1;
const MAC_OFFSET: usize = DELAY_OFFSET + 4;

/// One decoded routing slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RoutingSlot {
    /// Next-hop socket address (relay) or recipient id (final).
    pub(crate) dest: String,
    /// `RELAY_FLAG` or `FINAL_FLAG`.
    pub(crate) flag: u8,
    /// Forwarding delay in milliseconds.
    pub(crate) delay_ms: u32,
    /// MAC the next hop verifies over its β.
    pub(crate) next_mac: [u8; MAC_SIZE],
}

pub(crate) fn encode_slot(
    dest: &str,
    flag: u8,
    delay_ms: u32,
    next_mac: &[u8; MAC_SIZE],
) -> Result<[u8; ROUTING_SLOT_SIZE]> {
    if flag != RELAY_FLAG && flag != FINAL_FLAG {
        return Err(SphinxError::BadFlag(flag));
    }
    let dest_bytes = dest.as_bytes();
    if dest_bytes.is_empty() || dest_bytes.len() > MAX_ADDR_SIZE {
        return Err(SphinxError::BadRouting(dest.to_string()));
    }

    let mut slot = [0u8; ROUTING_SLOT_SIZE];
    slot[0] = dest_bytes.len() as u8;
    slot[1..1 + dest_bytes.len()].copy_from_slice(dest_bytes);
    slot[FLAG_OFFSET] = flag;
    slot[DELAY_OFFSET..DELAY_OFFSET + 4].copy_from_slice(&delay_ms.to_le_bytes());
    slot[MAC_OFFSET..].copy_from_slice(next_mac);
    Ok(slot)
}

pub(crate) fn decode_slot(buf: &[u8]) -> Result<RoutingSlot> {
    debug_assert_eq!(buf.len(), ROUTING_SLOT_SIZE);

    let dest_len = buf[0] as usize;
    if dest_len == 0 || dest_len > MAX_ADDR_SIZE {
        return Err(SphinxError::BadRouting(format!(
            "destination length {dest_len}"
        )));
    }
    let dest = std::str::from_utf8(&buf[1..1 + dest_len])
        .map_err(|_| SphinxError::BadRouting("destination is not UTF-8".to_string()))?
        .to_string();

    let flag = buf[FLAG_OFFSET];
    let delay_ms = u32::from_le_bytes(
        buf[DELAY_OFFSET..DELAY_OFFSET + 4]
            .try_into()
            .expect("slot widths are fixed"),
    );
    let mut next_mac = [0u8; MAC_SIZE];
    next_mac.copy_from_slice(&buf[MAC_OFFSET..ROUTING_SLOT_SIZE]);

    Ok(RoutingSlot {
        dest,
        flag,
        delay_ms,
        next_mac,
    })
}

//! Memory and SFU transaction records.
//!
//! Every interconnect in the simulator carries one of two payload families:
//! 1. **Memory transactions:** `MemoryRequest` (load, store, prefetch, or an
//!    atomic read-modify-write) and `MemoryReturn`, the uniform record used
//!    from the TP ports down to the DRAM channels.
//! 2. **SFU transactions:** `SfuRequest`, an opaque fixed-latency unit
//!    request that is echoed back on completion.
//!
//! Requests carry an inline payload buffer sized to the largest transaction
//! so records stay `Copy` and never allocate on the per-cycle path. The
//! destination bit-stack (`dst`) is stamped by each multiplexing layer on
//! the request path and unwound on the return path.

use crate::common::bits::BitStack58;
use crate::common::Paddr;

/// Largest payload a single transaction can carry, in bytes.
pub const MAX_PAYLOAD: usize = 128;

/// Memory operation kind.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum MemOp {
    /// Read `size` bytes; produces a return.
    Load,
    /// Write `size` bytes; absorbed, no return.
    Store,
    /// Pull a line toward the cache; absorbed, no return.
    Prefetch,
    /// Atomic fetch-and-add; returns the prior value.
    AmoAdd,
    /// Atomic fetch-and-and; returns the prior value.
    AmoAnd,
    /// Atomic fetch-and-or; returns the prior value.
    AmoOr,
    /// Atomic fetch-and-xor; returns the prior value.
    AmoXor,
    /// Atomic signed minimum; returns the prior value.
    AmoMin,
    /// Atomic signed maximum; returns the prior value.
    AmoMax,
    /// Atomic unsigned minimum; returns the prior value.
    AmoMinu,
    /// Atomic unsigned maximum; returns the prior value.
    AmoMaxu,
}

impl MemOp {
    /// Returns `true` for the atomic read-modify-write operations.
    pub fn is_amo(self) -> bool {
        !matches!(self, MemOp::Load | MemOp::Store | MemOp::Prefetch)
    }

    /// Returns `true` when the operation produces a return transaction.
    pub fn has_return(self) -> bool {
        !matches!(self, MemOp::Store | MemOp::Prefetch)
    }
}

/// Request flag bits.
pub mod flags {
    /// Traversal may stop at the first accepted hit.
    pub const ANY_HIT: u16 = 1 << 0;
}

/// A memory request transaction.
#[derive(Clone, Copy, Debug)]
pub struct MemoryRequest {
    /// Operation kind.
    pub op: MemOp,
    /// Payload size in bytes, at most [`MAX_PAYLOAD`].
    pub size: u8,
    /// Source port index at the unit currently holding the request.
    pub port: u16,
    /// Destination bit-stack; stamped per multiplexing layer.
    pub dst: BitStack58,
    /// Request flag bits.
    pub flags: u16,
    /// Physical byte address.
    pub paddr: Paddr,
    /// Inline payload (valid for the first `size` bytes of stores/atomics).
    pub data: [u8; MAX_PAYLOAD],
}

impl MemoryRequest {
    /// Builds a load of `size` bytes at `paddr` from `port`.
    pub fn load(paddr: Paddr, size: usize, port: u16) -> Self {
        debug_assert!(size <= MAX_PAYLOAD);
        Self {
            op: MemOp::Load,
            size: size as u8,
            port,
            dst: BitStack58::default(),
            flags: 0,
            paddr,
            data: [0; MAX_PAYLOAD],
        }
    }

    /// Builds a prefetch of `size` bytes at `paddr` from `port`.
    pub fn prefetch(paddr: Paddr, size: usize, port: u16) -> Self {
        Self {
            op: MemOp::Prefetch,
            ..Self::load(paddr, size, port)
        }
    }

    /// Builds a store of `bytes` at `paddr` from `port`.
    pub fn store(paddr: Paddr, bytes: &[u8], port: u16) -> Self {
        debug_assert!(bytes.len() <= MAX_PAYLOAD);
        let mut data = [0u8; MAX_PAYLOAD];
        data[..bytes.len()].copy_from_slice(bytes);
        Self {
            op: MemOp::Store,
            size: bytes.len() as u8,
            port,
            dst: BitStack58::default(),
            flags: 0,
            paddr,
            data,
        }
    }

    /// Builds a 32-bit atomic read-modify-write at `paddr` from `port`.
    pub fn amo(op: MemOp, paddr: Paddr, operand: u32, port: u16) -> Self {
        debug_assert!(op.is_amo());
        let mut req = Self::store(paddr, &operand.to_le_bytes(), port);
        req.op = op;
        req
    }

    /// Returns the payload bytes that are valid for this request.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Reads the first payload word as a little-endian `u32`.
    pub fn data_u32(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }
}

/// A memory return transaction.
///
/// Mirrors the request it answers, minus the operation kind, with the data
/// buffer populated.
#[derive(Clone, Copy, Debug)]
pub struct MemoryReturn {
    /// Payload size in bytes; zero is valid and used as a termination
    /// marker by the stream scheduler.
    pub size: u8,
    /// Destination port at the unit the return is currently traversing.
    pub port: u16,
    /// Destination bit-stack inherited from the request.
    pub dst: BitStack58,
    /// Physical byte address of the answered request.
    pub paddr: Paddr,
    /// Fetched bytes (valid for the first `size` bytes).
    pub data: [u8; MAX_PAYLOAD],
}

impl MemoryReturn {
    /// Builds the return for `req` carrying `bytes`.
    pub fn from_request(req: &MemoryRequest, bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() >= req.size as usize);
        let mut data = [0u8; MAX_PAYLOAD];
        data[..req.size as usize].copy_from_slice(&bytes[..req.size as usize]);
        Self {
            size: req.size,
            port: req.port,
            dst: req.dst,
            paddr: req.paddr,
            data,
        }
    }

    /// Builds an empty (size zero) return addressed to `port`.
    pub fn empty(port: u16) -> Self {
        Self {
            size: 0,
            port,
            dst: BitStack58::default(),
            paddr: 0,
            data: [0; MAX_PAYLOAD],
        }
    }

    /// Returns the payload bytes that are valid for this return.
    pub fn payload(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    /// Reads the first payload word as a little-endian `u32`.
    pub fn data_u32(&self) -> u32 {
        u32::from_le_bytes([self.data[0], self.data[1], self.data[2], self.data[3]])
    }
}

impl Default for MemoryReturn {
    fn default() -> Self {
        Self::empty(0)
    }
}

/// An opaque special-function-unit transaction.
///
/// The SFU echoes the record back to `port` after its configured latency;
/// the payload is meaningful only to the issuing client.
#[derive(Clone, Copy, Default, Debug)]
pub struct SfuRequest {
    /// Source port index.
    pub port: u16,
    /// Client-side destination tag (register descriptor or slot id).
    pub dst: u16,
    /// Opaque payload.
    pub payload: u64,
}

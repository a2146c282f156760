//! Physical address to DRAM coordinate decode.
//!
//! A pure function of the configuration: the address is stripped of its
//! block offset, then channel, rank, bank, row, and column fields are
//! peeled off in the order fixed by the mapping scheme. `encode` is the
//! exact inverse and exists for tests and the bucket allocator.

use super::config::{AddressMapping, DramConfig};
use crate::common::bits::{log2i, nbit_mask};
use crate::common::Paddr;

/// Decoded DRAM coordinates.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct DramAddress {
    /// Channel index.
    pub channel: u64,
    /// Rank index within the channel.
    pub rank: u64,
    /// Bank index within the rank.
    pub bank: u64,
    /// Row index within the bank.
    pub row: u64,
    /// Column index within the row.
    pub column: u64,
}

#[inline]
fn peel(value: &mut u64, bits: u32) -> u64 {
    let field = *value & nbit_mask(bits);
    *value >>= bits;
    field
}

/// Splits `paddr` into DRAM coordinates under `config`'s mapping.
pub fn decode(config: &DramConfig, paddr: Paddr) -> DramAddress {
    let mut v = paddr >> log2i(config.block_size);
    match config.address_mapping {
        AddressMapping::ColumnLow => {
            let column = peel(&mut v, log2i(config.num_columns));
            let channel = peel(&mut v, log2i(config.num_channels));
            let bank = peel(&mut v, log2i(config.num_banks));
            let rank = peel(&mut v, log2i(config.num_ranks));
            let row = peel(&mut v, log2i(config.num_rows));
            DramAddress {
                channel,
                rank,
                bank,
                row,
                column,
            }
        }
        AddressMapping::ChannelLow => {
            let channel = peel(&mut v, log2i(config.num_channels));
            let bank = peel(&mut v, log2i(config.num_banks));
            let rank = peel(&mut v, log2i(config.num_ranks));
            let column = peel(&mut v, log2i(config.num_columns));
            let row = peel(&mut v, log2i(config.num_rows));
            DramAddress {
                channel,
                rank,
                bank,
                row,
                column,
            }
        }
    }
}

/// Returns only the channel field of the decode; the request crossbar runs
/// this on every routing decision.
pub fn channel_of(config: &DramConfig, paddr: Paddr) -> u64 {
    let mut v = paddr >> log2i(config.block_size);
    if config.address_mapping == AddressMapping::ColumnLow {
        let _ = peel(&mut v, log2i(config.num_columns));
    }
    peel(&mut v, log2i(config.num_channels))
}

/// Rebuilds the physical address for `addr`; the inverse of [`decode`].
pub fn encode(config: &DramConfig, addr: &DramAddress) -> Paddr {
    let mut v = addr.row;
    match config.address_mapping {
        AddressMapping::ColumnLow => {
            v = (v << log2i(config.num_ranks)) | addr.rank;
            v = (v << log2i(config.num_banks)) | addr.bank;
            v = (v << log2i(config.num_channels)) | addr.channel;
            v = (v << log2i(config.num_columns)) | addr.column;
        }
        AddressMapping::ChannelLow => {
            v = (v << log2i(config.num_columns)) | addr.column;
            v = (v << log2i(config.num_ranks)) | addr.rank;
            v = (v << log2i(config.num_banks)) | addr.bank;
            v = (v << log2i(config.num_channels)) | addr.channel;
        }
    }
    v << log2i(config.block_size)
}

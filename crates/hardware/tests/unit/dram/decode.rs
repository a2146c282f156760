//! Address decode round trips and mapping shape.

use proptest::prelude::*;
use raysim_core::mem::dram::{channel_of, decode, encode, AddressMapping, DramConfig};

fn config(mapping: AddressMapping) -> DramConfig {
    DramConfig {
        num_channels: 4,
        num_ranks: 2,
        num_banks: 8,
        num_rows: 1 << 12,
        num_columns: 128,
        block_size: 64,
        address_mapping: mapping,
        ..DramConfig::default()
    }
}

#[test]
fn channel_low_stripes_consecutive_blocks() {
    let cfg = config(AddressMapping::ChannelLow);
    for block in 0..8u64 {
        assert_eq!(channel_of(&cfg, block * 64), block % 4);
    }
}

#[test]
fn column_low_keeps_a_row_on_one_channel() {
    let cfg = config(AddressMapping::ColumnLow);
    // All columns of one row decode to the same channel.
    let base = decode(&cfg, 0);
    for column in 0..128u64 {
        let addr = decode(&cfg, column * 64);
        assert_eq!(addr.channel, base.channel);
        assert_eq!(addr.row, base.row);
        assert_eq!(addr.column, column);
    }
    // The next row stripe moves to the next channel.
    assert_eq!(channel_of(&cfg, 128 * 64), 1);
}

#[test]
fn fields_stay_in_range() {
    let cfg = config(AddressMapping::ChannelLow);
    let addr = decode(&cfg, 0x3FFF_FFC0);
    assert!(addr.channel < cfg.num_channels);
    assert!(addr.rank < cfg.num_ranks);
    assert!(addr.bank < cfg.num_banks);
    assert!(addr.row < cfg.num_rows);
    assert!(addr.column < cfg.num_columns);
}

proptest! {
    #[test]
    fn decode_encode_round_trip_channel_low(block in 0u64..(1 << 24)) {
        let cfg = config(AddressMapping::ChannelLow);
        let paddr = block * cfg.block_size;
        let addr = decode(&cfg, paddr);
        prop_assert_eq!(encode(&cfg, &addr), paddr);
        prop_assert_eq!(channel_of(&cfg, paddr), addr.channel);
    }

    #[test]
    fn decode_encode_round_trip_column_low(block in 0u64..(1 << 24)) {
        let cfg = config(AddressMapping::ColumnLow);
        let paddr = block * cfg.block_size;
        let addr = decode(&cfg, paddr);
        prop_assert_eq!(encode(&cfg, &addr), paddr);
        prop_assert_eq!(channel_of(&cfg, paddr), addr.channel);
    }
}

//! DRAM configuration loading and validation.

use pretty_assertions::assert_eq;
use raysim_core::mem::dram::{AddressMapping, DramConfig};

const YAML: &str = r#"
num_channels: 4
num_ranks: 2
num_banks: 8
num_rows: 16384
num_columns: 128
block_size: 64
address_mapping: column-low
clock_multiplier: 2
timing:
  t_rcd: 14
  t_cas: 14
  t_rp: 14
  t_rc: 48
  t_refi: 7800
"#;

#[test]
fn yaml_overrides_merge_with_defaults() {
    let config = DramConfig::from_yaml_str(YAML).expect("valid config");
    assert_eq!(config.num_channels, 4);
    assert_eq!(config.address_mapping, AddressMapping::ColumnLow);
    assert_eq!(config.timing.t_rcd, 14);
    assert_eq!(config.timing.t_rc, 48);
    // Unlisted timing fields keep their defaults.
    assert_eq!(config.timing.t_faw, DramConfig::default().timing.t_faw);
}

#[test]
fn yaml_file_round_trip() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = dir.path().join("ddr.yaml");
    std::fs::write(&path, YAML).expect("write config");

    let config = DramConfig::from_yaml_file(&path).expect("valid config");
    assert_eq!(config.num_banks, 8);
    assert_eq!(config.row_size(), 128 * 64);
}

#[test]
fn non_power_of_two_geometry_is_rejected() {
    let err = DramConfig::from_yaml_str("num_banks: 6").expect_err("must fail validation");
    assert!(err.to_string().contains("num_banks"));
}

#[test]
fn bad_watermarks_are_rejected() {
    let err = DramConfig::from_yaml_str("write_drain_high: 4\nwrite_drain_low: 8")
        .expect_err("must fail validation");
    assert!(err.to_string().contains("watermark"));
}

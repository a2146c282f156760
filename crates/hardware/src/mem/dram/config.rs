//! DRAM geometry and timing configuration.
//!
//! The channel model is entirely table-driven: geometry (channels, ranks,
//! banks, rows, columns, block size), the address mapping, and the full
//! per-command timing table come from a `DramConfig`, loaded from YAML or
//! built from the defaults. The config is validated once and immutable for
//! the lifetime of the simulation; units capture a shared reference.

use serde::Deserialize;

use crate::config::ConfigError;

/// Physical-address-to-DRAM mapping scheme.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AddressMapping {
    /// Channel bits sit directly above the block offset; consecutive blocks
    /// stripe across channels.
    #[default]
    ChannelLow,
    /// Column bits sit lowest with channel bits above them; a row streams
    /// from one channel before the stripe advances.
    ColumnLow,
}

/// Per-command timing table, in DRAM clock cycles.
///
/// Field names follow the JEDEC shorthand. Values below are a DDR3-1600
/// style part; production runs load the table for the simulated device
/// from YAML.
#[derive(Clone, Copy, Debug, Deserialize)]
#[serde(default)]
pub struct DramTiming {
    /// Activate to column command.
    pub t_rcd: u64,
    /// Activate to precharge.
    pub t_ras: u64,
    /// Activate to activate, same bank.
    pub t_rc: u64,
    /// Precharge period.
    pub t_rp: u64,
    /// Column read to first data.
    pub t_cas: u64,
    /// Column write to first data.
    pub t_cwd: u64,
    /// Column command to column command, same rank.
    pub t_ccd: u64,
    /// Read to precharge.
    pub t_rtp: u64,
    /// Write recovery.
    pub t_wr: u64,
    /// Write to read turnaround, same rank.
    pub t_wtr: u64,
    /// Activate to activate, different banks of one rank.
    pub t_rrd: u64,
    /// Four-activate window.
    pub t_faw: u64,
    /// Refresh cycle time.
    pub t_rfc: u64,
    /// Average refresh interval; eight refreshes are owed per window of
    /// `8 * t_refi`.
    pub t_refi: u64,
    /// Data burst duration on the bus.
    pub t_data_trans: u64,
    /// Rank-to-rank switching penalty.
    pub t_rtrs: u64,
    /// Power-down exit (fast modes).
    pub t_xp: u64,
    /// Power-down exit with DLL relock (slow mode).
    pub t_xp_dll: u64,
    /// Minimum power-down residency.
    pub t_pd_min: u64,
}

impl Default for DramTiming {
    fn default() -> Self {
        Self {
            t_rcd: 11,
            t_ras: 28,
            t_rc: 39,
            t_rp: 11,
            t_cas: 11,
            t_cwd: 5,
            t_ccd: 4,
            t_rtp: 6,
            t_wr: 12,
            t_wtr: 6,
            t_rrd: 5,
            t_faw: 32,
            t_rfc: 128,
            t_refi: 6240,
            t_data_trans: 4,
            t_rtrs: 2,
            t_xp: 5,
            t_xp_dll: 20,
            t_pd_min: 6,
        }
    }
}

/// DRAM geometry, queues, policy knobs, and timing.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct DramConfig {
    /// Independent channels.
    pub num_channels: u64,
    /// Ranks per channel.
    pub num_ranks: u64,
    /// Banks per rank.
    pub num_banks: u64,
    /// Rows per bank.
    pub num_rows: u64,
    /// Columns per row.
    pub num_columns: u64,
    /// Bytes per column access (the block size of the hierarchy).
    pub block_size: u64,
    /// Backing storage size in bytes.
    pub size: u64,
    /// Address mapping scheme, fixed per simulation.
    pub address_mapping: AddressMapping,
    /// DRAM clock ticks per simulator tick.
    pub clock_multiplier: u64,
    /// Per-channel read queue depth.
    pub read_queue_depth: usize,
    /// Per-channel write queue depth.
    pub write_queue_depth: usize,
    /// Enter write-drain mode above this occupancy.
    pub write_drain_high: usize,
    /// Leave write-drain mode below this occupancy.
    pub write_drain_low: usize,
    /// Latency, in DRAM cycles, of a read answered out of the write queue.
    pub lookaside_latency: u64,
    /// Close the row after the last queued access to it.
    pub auto_precharge: bool,
    /// Enter precharge power-down after this many idle DRAM cycles; `None`
    /// disables power-down.
    pub idle_powerdown_cycles: Option<u64>,
    /// Per-command timing table.
    pub timing: DramTiming,
}

impl Default for DramConfig {
    fn default() -> Self {
        Self {
            num_channels: 1,
            num_ranks: 1,
            num_banks: 8,
            num_rows: 1 << 14,
            num_columns: 128,
            block_size: 64,
            size: 1 << 30,
            address_mapping: AddressMapping::default(),
            clock_multiplier: 2,
            read_queue_depth: 64,
            write_queue_depth: 64,
            write_drain_high: 48,
            write_drain_low: 16,
            lookaside_latency: 11,
            auto_precharge: false,
            idle_powerdown_cycles: None,
            timing: DramTiming::default(),
        }
    }
}

impl DramConfig {
    /// Bytes covered by one row of one bank.
    pub fn row_size(&self) -> u64 {
        self.num_columns * self.block_size
    }

    /// Parses a configuration from YAML text and validates it.
    pub fn from_yaml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates a configuration from a YAML file.
    pub fn from_yaml_file(path: &std::path::Path) -> Result<Self, ConfigError> {
        Self::from_yaml_str(&std::fs::read_to_string(path)?)
    }

    /// Checks the geometry invariants the decode function relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, value) in [
            ("num_channels", self.num_channels),
            ("num_ranks", self.num_ranks),
            ("num_banks", self.num_banks),
            ("num_rows", self.num_rows),
            ("num_columns", self.num_columns),
            ("block_size", self.block_size),
        ] {
            if !value.is_power_of_two() {
                return Err(ConfigError::Invalid(format!("{name} must be a power of two, got {value}")));
            }
        }
        if self.clock_multiplier == 0 {
            return Err(ConfigError::Invalid("clock_multiplier must be nonzero".into()));
        }
        if self.write_drain_low >= self.write_drain_high
            || self.write_drain_high > self.write_queue_depth
        {
            return Err(ConfigError::Invalid(
                "write drain watermarks must satisfy low < high <= depth".into(),
            ));
        }
        Ok(())
    }
}

//! Configuration system for the simulator.
//!
//! This module defines the configuration structures used to parameterize a
//! run. It provides:
//! 1. **Defaults:** baseline hardware constants (machine shape, cache
//!    geometry, RT core pipelines, stream scheduler policy).
//! 2. **Structures:** hierarchical config for the machine, the caches, the
//!    RT cores, and the streaming engine; the DRAM timing tables live in
//!    `mem::dram::config` and are referenced by file path here.
//! 3. **Errors:** `ConfigError`, the only recoverable error surface of the
//!    crate; everything past configuration is assertion-checked.
//!
//! Configuration is supplied as JSON (`Config::from_json_str`) or built
//! from `Config::default()`; the DRAM table is a separate YAML document so
//! device timing files can be swapped without touching the machine config.

use serde::Deserialize;
use thiserror::Error;

use crate::units::stream_scheduler::{TraversalScheme, WeightScheme};

/// Default configuration constants.
///
/// These are the values used when a field is absent from the supplied
/// configuration document.
mod defaults {
    /// Thread modules in the machine.
    pub const NUM_TMS: usize = 64;

    /// Thread processors per TM.
    pub const NUM_TPS_PER_TM: usize = 64;

    /// Ray slots per RT core.
    pub const MAX_RAYS: usize = 128;

    /// Cache line size in bytes; also the DRAM transfer block.
    pub const BLOCK_SIZE: u64 = 64;

    /// L1 capacity in bytes (128 KiB).
    pub const L1_SIZE: u64 = 128 << 10;

    /// L1 associativity.
    pub const L1_ASSOCIATIVITY: usize = 16;

    /// L1 banks.
    pub const L1_BANKS: usize = 8;

    /// L1 hit latency in ticks.
    pub const L1_LATENCY: u32 = 1;

    /// L2 capacity in bytes (72 MiB).
    pub const L2_SIZE: u64 = 72 << 20;

    /// L2 associativity.
    pub const L2_ASSOCIATIVITY: usize = 18;

    /// L2 banks.
    pub const L2_BANKS: usize = 16;

    /// L2 hit latency in ticks.
    pub const L2_LATENCY: u32 = 3;

    /// MSHRs per cache bank.
    pub const NUM_MSHR: usize = 8;

    /// Crossbar arbiter width inside the caches.
    pub const CROSSBAR_WIDTH: usize = 64;

    /// Box intersection pipeline latency in ticks.
    pub const BOX_LATENCY: u32 = 3;

    /// Triangle intersection pipeline latency in ticks.
    pub const TRI_LATENCY: u32 = 22;

    /// Triangle pipeline initiation interval in ticks.
    pub const TRI_ISSUE_INTERVAL: u32 = 8;

    /// Wide BVH node width.
    pub const NODE_WIDTH: usize = 2;

    /// Treelet byte budget (64 KiB).
    pub const TREELET_BYTES: u64 = 64 << 10;

    /// Coalescer banks in the stream scheduler.
    pub const STREAM_BANKS: usize = 16;

    /// Bound on simultaneously active segments.
    pub const MAX_ACTIVE_SEGMENTS: usize = 1024 * 1024;

    /// Scene buffer capacity in treelets.
    pub const SCENE_BUFFER_SLOTS: u64 = 64;

    /// Scene buffer banks.
    pub const SCENE_BUFFER_BANKS: usize = 16;

    /// Leading blocks pulled per on-demand scene buffer completion.
    pub const SCENE_PREFETCH_BLOCKS: u64 = 8;

    /// Work indices handed out per tile scheduler re-arm.
    pub const TILE_BLOCK_SIZE: u32 = 64;
}

/// Errors raised while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The document could not be read.
    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),
    /// The JSON document did not parse.
    #[error("failed to parse configuration: {0}")]
    Json(#[from] serde_json::Error),
    /// The YAML document did not parse.
    #[error("failed to parse configuration: {0}")]
    Yaml(#[from] serde_yaml::Error),
    /// A field combination violates a structural invariant.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Candidate expansion order, as named in configuration documents.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "UPPERCASE")]
pub enum TraversalSchemeConfig {
    /// Breadth-first expansion.
    #[default]
    Bfs,
    /// Weighted depth-first expansion.
    Dfs,
}

impl From<TraversalSchemeConfig> for TraversalScheme {
    fn from(value: TraversalSchemeConfig) -> Self {
        match value {
            TraversalSchemeConfig::Bfs => TraversalScheme::Bfs,
            TraversalSchemeConfig::Dfs => TraversalScheme::Dfs,
        }
    }
}

/// Depth-first weighting, as named in configuration documents.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum WeightSchemeConfig {
    /// Total accumulated weight.
    #[default]
    TotalWeight,
    /// Weight per ray.
    AverageRayWeight,
    /// Memory order; reachable but experimental.
    MemoryOrder,
}

impl From<WeightSchemeConfig> for WeightScheme {
    fn from(value: WeightSchemeConfig) -> Self {
        match value {
            WeightSchemeConfig::TotalWeight => WeightScheme::TotalWeight,
            WeightSchemeConfig::AverageRayWeight => WeightScheme::AverageRayWeight,
            WeightSchemeConfig::MemoryOrder => WeightScheme::MemoryOrder,
        }
    }
}

/// Per-level cache configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct CacheLevelConfig {
    /// Capacity in bytes.
    pub size: u64,
    /// Ways per set.
    pub associativity: usize,
    /// Banks.
    pub num_banks: usize,
    /// Bank-select mask; zero selects the bits above the block offset.
    pub bank_select_mask: u64,
    /// MSHRs per bank.
    pub num_mshr: usize,
    /// Hit latency in ticks.
    pub latency: u32,
    /// Crossbar arbiter width.
    pub crossbar_width: usize,
    /// Keep retired MSHRs addressable one extra tick. Accepted but inert.
    pub retired_lfb_check: bool,
}

impl Default for CacheLevelConfig {
    fn default() -> Self {
        Self {
            size: defaults::L1_SIZE,
            associativity: defaults::L1_ASSOCIATIVITY,
            num_banks: defaults::L1_BANKS,
            bank_select_mask: 0,
            num_mshr: defaults::NUM_MSHR,
            latency: defaults::L1_LATENCY,
            crossbar_width: defaults::CROSSBAR_WIDTH,
            retired_lfb_check: false,
        }
    }
}

impl CacheLevelConfig {
    /// The default L2 shape.
    pub fn l2() -> Self {
        Self {
            size: defaults::L2_SIZE,
            associativity: defaults::L2_ASSOCIATIVITY,
            num_banks: defaults::L2_BANKS,
            latency: defaults::L2_LATENCY,
            ..Self::default()
        }
    }
}

/// RT core configuration shared by both engine flavors.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RtCoreLevelConfig {
    /// Ray slots per core.
    pub max_rays: usize,
    /// Box pipeline latency in ticks.
    pub box_latency: u32,
    /// Triangle pipeline latency in ticks.
    pub tri_latency: u32,
    /// Triangle pipeline initiation interval in ticks.
    pub tri_issue_interval: u32,
    /// Wide node width.
    pub node_width: usize,
    /// Seed pulled rays from the global hit record (streaming engine).
    pub use_early_termination: bool,
}

impl Default for RtCoreLevelConfig {
    fn default() -> Self {
        Self {
            max_rays: defaults::MAX_RAYS,
            box_latency: defaults::BOX_LATENCY,
            tri_latency: defaults::TRI_LATENCY,
            tri_issue_interval: defaults::TRI_ISSUE_INTERVAL,
            node_width: defaults::NODE_WIDTH,
            use_early_termination: false,
        }
    }
}

/// Streaming engine configuration.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Coalescer banks.
    pub num_banks: usize,
    /// Candidate expansion order.
    pub traversal_scheme: TraversalSchemeConfig,
    /// Depth-first weighting.
    pub weight_scheme: WeightSchemeConfig,
    /// Bound on simultaneously active segments.
    pub max_active_segments: usize,
    /// Treelet byte budget.
    pub treelet_bytes: u64,
    /// Use the scene buffer; without it prefetch falls back to the L2.
    pub use_scene_buffer: bool,
    /// Scene buffer capacity in treelets.
    pub scene_buffer_slots: u64,
    /// Scene buffer banks.
    pub scene_buffer_banks: usize,
    /// Fetch only the leading span of a treelet eagerly.
    pub dynamic_prefetch: bool,
    /// Leading blocks pulled per on-demand completion.
    pub scene_prefetch_blocks: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            num_banks: defaults::STREAM_BANKS,
            traversal_scheme: TraversalSchemeConfig::default(),
            weight_scheme: WeightSchemeConfig::default(),
            max_active_segments: defaults::MAX_ACTIVE_SEGMENTS,
            treelet_bytes: defaults::TREELET_BYTES,
            use_scene_buffer: true,
            scene_buffer_slots: defaults::SCENE_BUFFER_SLOTS,
            scene_buffer_banks: defaults::SCENE_BUFFER_BANKS,
            dynamic_prefetch: false,
            scene_prefetch_blocks: defaults::SCENE_PREFETCH_BLOCKS,
        }
    }
}

/// Root configuration.
#[derive(Clone, Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Machine shape.
    pub machine: MachineConfig,
    /// L1 cache (one per TM).
    pub l1: CacheLevelConfig,
    /// Shared L2 cache.
    pub l2: CacheLevelConfig,
    /// RT cores.
    pub rt_core: RtCoreLevelConfig,
    /// Streaming engine.
    pub stream: StreamConfig,
    /// Path of the DRAM timing YAML; `None` uses the built-in table.
    pub dram_config_path: Option<std::path::PathBuf>,
}

/// Machine shape.
#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Thread modules.
    pub num_tms: usize,
    /// Thread processors per TM.
    pub num_tps_per_tm: usize,
    /// Cache line and DRAM transfer block size in bytes.
    pub block_size: u64,
    /// Work indices per tile scheduler re-arm.
    pub tile_block_size: u32,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            num_tms: defaults::NUM_TMS,
            num_tps_per_tm: defaults::NUM_TPS_PER_TM,
            block_size: defaults::BLOCK_SIZE,
            tile_block_size: defaults::TILE_BLOCK_SIZE,
        }
    }
}

impl Config {
    /// Parses a configuration from JSON text and validates it.
    pub fn from_json_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Checks the structural invariants the wiring layer relies on.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.machine.block_size.is_power_of_two() {
            return Err(ConfigError::Invalid("block_size must be a power of two".into()));
        }
        for (name, cache) in [("l1", &self.l1), ("l2", &self.l2)] {
            if cache.size % (cache.associativity as u64 * self.machine.block_size) != 0 {
                return Err(ConfigError::Invalid(format!(
                    "{name} size must be a multiple of associativity * block_size"
                )));
            }
        }
        if self.rt_core.node_width < 2 || self.rt_core.node_width > crate::rt::bvh::MAX_NODE_WIDTH {
            return Err(ConfigError::Invalid(format!(
                "node_width must be between 2 and {}",
                crate::rt::bvh::MAX_NODE_WIDTH
            )));
        }
        if self.stream.treelet_bytes % self.machine.block_size != 0 {
            return Err(ConfigError::Invalid(
                "treelet_bytes must be a multiple of block_size".into(),
            ));
        }
        Ok(())
    }
}

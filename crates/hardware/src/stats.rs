//! Simulation statistics collection and reporting.
//!
//! Every unit keeps its own log of counters with `reset` and `accumulate`;
//! this module gathers them into a single report. It provides:
//! 1. **Aggregation:** `SimStats` accumulates per-unit logs across the
//!    fleet (many TMs share one logical entry).
//! 2. **Derived metrics:** bandwidth, hit rates, and stall breakdowns.
//! 3. **Export:** the whole report serializes to JSON so runs can be
//!    diffed and plotted; printing goes through `Display`.

use std::fmt;

use serde::Serialize;

use crate::common::Cycles;
use crate::mem::buffer::BufferLog;
use crate::mem::cache::CacheLog;
use crate::mem::dram::DramLog;
use crate::units::rt_core::RtCoreLog;
use crate::units::scene_buffer::SceneBufferLog;
use crate::units::stream_scheduler::StreamSchedulerLog;
use crate::units::treelet_rt_core::TreeletRtCoreLog;

/// Aggregated statistics for one run.
#[derive(Clone, Default, Serialize)]
pub struct SimStats {
    /// Ticks simulated.
    pub cycles: Cycles,
    /// L1 logs accumulated across TMs.
    pub l1: CacheLog,
    /// L2 log.
    pub l2: CacheLog,
    /// DRAM log.
    pub dram: DramLog,
    /// Scratch buffer logs accumulated across TMs.
    pub buffers: BufferLog,
    /// Direct RT core logs accumulated across TMs.
    pub rt_cores: RtCoreLog,
    /// Streaming RT core logs accumulated across TMs.
    pub treelet_rt_cores: TreeletRtCoreLog,
    /// Stream scheduler log.
    pub stream_scheduler: StreamSchedulerLog,
    /// Scene buffer log.
    pub scene_buffer: SceneBufferLog,
}

impl SimStats {
    /// Creates an empty report.
    pub fn new() -> Self {
        Self::default()
    }

    /// Serializes the report as pretty JSON.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).expect("stats serialize to JSON")
    }
}

impl fmt::Display for SimStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cycles = self.cycles.max(1);
        writeln!(f, "Cycles: {}", self.cycles)?;

        writeln!(f, "\n-- L1 --")?;
        writeln!(f, "Hit rate: {:.2}%", self.l1.hit_rate() * 100.0)?;
        writeln!(f, "Half misses: {}", self.l1.half_misses)?;
        writeln!(f, "MSHR stalls: {}", self.l1.mshr_stalls)?;

        writeln!(f, "\n-- L2 --")?;
        writeln!(f, "Hit rate: {:.2}%", self.l2.hit_rate() * 100.0)?;
        writeln!(f, "Half misses: {}", self.l2.half_misses)?;

        writeln!(f, "\n-- DRAM --")?;
        writeln!(
            f,
            "Read bandwidth: {:.2} bytes/cycle",
            self.dram.bytes_read as f64 / cycles as f64
        )?;
        writeln!(
            f,
            "Write bandwidth: {:.2} bytes/cycle",
            self.dram.bytes_written as f64 / cycles as f64
        )?;
        writeln!(f, "Row hit rate: {:.2}%", self.dram.row_hit_rate() * 100.0)?;
        writeln!(f, "Refreshes: {}", self.dram.refreshes)?;

        if self.rt_cores.rays != 0 {
            writeln!(f, "\n-- RT cores --")?;
            writeln!(f, "Rays: {}", self.rt_cores.rays)?;
            writeln!(
                f,
                "Nodes/ray: {:.2}",
                self.rt_cores.nodes as f64 / self.rt_cores.rays as f64
            )?;
            writeln!(
                f,
                "Tris/ray: {:.2}",
                self.rt_cores.tris as f64 / self.rt_cores.rays as f64
            )?;
        }

        if self.stream_scheduler.work_items != 0 {
            writeln!(f, "\n-- Stream scheduler --")?;
            writeln!(f, "Rays: {}", self.stream_scheduler.rays)?;
            writeln!(
                f,
                "Ray duplication: {:.2}",
                self.stream_scheduler.work_items as f64 / self.stream_scheduler.rays.max(1) as f64
            )?;
            writeln!(
                f,
                "Rays per bucket: {:.2}",
                self.stream_scheduler.work_items as f64
                    / self.stream_scheduler.buckets_launched.max(1) as f64
            )?;
            writeln!(
                f,
                "Buckets per segment: {:.2}",
                self.stream_scheduler.buckets_launched as f64
                    / self.stream_scheduler.segments_launched.max(1) as f64
            )?;
            writeln!(f, "Segments: {}", self.stream_scheduler.segments_launched)?;
            writeln!(
                f,
                "Single-bucket segments: {}",
                self.stream_scheduler.single_bucket_segments
            )?;
        }

        Ok(())
    }
}

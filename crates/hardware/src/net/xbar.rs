//! Switching primitives: cascades, crossbars, and the cascaded crossbar.
//!
//! All four switches share the same buffered shell: a FIFO per source, a
//! FIFO per sink, and per-port pending flags re-evaluated at `clock`. They
//! differ only in how payloads move from source FIFOs to sink FIFOs:
//! 1. **`Cascade`:** M sources funnel into N sinks (M >= N); each sink
//!    round-robins over its M/N assigned sources.
//! 2. **`Decascade`:** the inverse shape (M <= N); each source routes to the
//!    sink chosen by a per-payload sink function.
//! 3. **`Crossbar`:** full any-to-any M -> N with per-sink round-robin
//!    arbitration.
//! 4. **`CascadedCrossbar`:** externally a crossbar, internally a three
//!    stage M -> w_src -> w_sink -> N network that bounds per-arbiter
//!    fan-in, trading one extra arbitration stage for area.
//!
//! Sink functions are passed to `clock` as closures so routing stays
//! statically dispatched in the per-tick hot loop.

use std::collections::VecDeque;

use crate::common::arbiter::RoundRobinArbiter;

/// Default depth for source and sink FIFOs.
pub const DEFAULT_FIFO_DEPTH: usize = 1;

/// Buffered source/sink shell shared by every switch.
struct Buffered<T> {
    src: Vec<VecDeque<T>>,
    snk: Vec<VecDeque<T>>,
    src_depth: usize,
    snk_depth: usize,
    in_busy: Vec<bool>,
    out_valid: Vec<bool>,
}

impl<T> Buffered<T> {
    fn new(sources: usize, sinks: usize, src_depth: usize, snk_depth: usize) -> Self {
        Self {
            src: (0..sources).map(|_| VecDeque::new()).collect(),
            snk: (0..sinks).map(|_| VecDeque::new()).collect(),
            src_depth,
            snk_depth,
            in_busy: vec![false; sources],
            out_valid: vec![false; sinks],
        }
    }

    fn refresh_flags(&mut self) {
        for i in 0..self.src.len() {
            self.in_busy[i] = self.src[i].len() >= self.src_depth;
        }
        for i in 0..self.snk.len() {
            self.out_valid[i] = !self.snk[i].is_empty();
        }
    }

    fn sink_full(&self, sink: usize) -> bool {
        self.snk[sink].len() >= self.snk_depth
    }

    fn transfer(&mut self, source: usize, sink: usize) {
        let payload = self.src[source].pop_front().expect("arbiter granted an empty source");
        self.snk[sink].push_back(payload);
    }

    fn is_write_valid(&self, source: usize) -> bool {
        !self.in_busy[source]
    }

    fn write(&mut self, entry: T, source: usize) {
        assert!(self.is_write_valid(source), "switch write while source full");
        self.in_busy[source] = true;
        self.src[source].push_back(entry);
    }

    fn is_read_valid(&self, sink: usize) -> bool {
        self.out_valid[sink]
    }

    fn peek(&self, sink: usize) -> &T {
        assert!(self.is_read_valid(sink), "switch peek while sink empty");
        self.snk[sink].front().expect("valid flag out of sync")
    }

    fn read(&mut self, sink: usize) -> T {
        assert!(self.is_read_valid(sink), "switch read while sink empty");
        self.out_valid[sink] = false;
        self.snk[sink].pop_front().expect("valid flag out of sync")
    }
}

macro_rules! four_op_contract {
    () => {
        /// Returns the number of source ports.
        pub fn num_sources(&self) -> usize {
            self.inner.src.len()
        }

        /// Returns the number of sink ports.
        pub fn num_sinks(&self) -> usize {
            self.inner.snk.len()
        }

        /// Returns `true` when source `index` can accept a payload this tick.
        pub fn is_write_valid(&self, index: usize) -> bool {
            self.inner.is_write_valid(index)
        }

        /// Writes a payload on source `index`. Clock fall only.
        pub fn write(&mut self, entry: T, index: usize) {
            self.inner.write(entry, index);
        }

        /// Returns `true` when sink `index` holds a readable payload.
        pub fn is_read_valid(&self, index: usize) -> bool {
            self.inner.is_read_valid(index)
        }

        /// Returns a reference to the payload at sink `index`. Clock rise only.
        pub fn peek(&self, index: usize) -> &T {
            self.inner.peek(index)
        }

        /// Removes and returns the payload at sink `index`. Clock rise only.
        pub fn read(&mut self, index: usize) -> T {
            self.inner.read(index)
        }
    };
}

/// Funnel from M sources down to N sinks (M >= N).
///
/// Source `s` is statically assigned to sink `s / ceil(M/N)`; each sink
/// round-robins over its assigned group and consumes at most one payload per
/// tick.
pub struct Cascade<T> {
    inner: Buffered<T>,
    ratio: usize,
    arbiters: Vec<RoundRobinArbiter>,
}

impl<T> Cascade<T> {
    /// Creates a cascade with default FIFO depths.
    pub fn new(sources: usize, sinks: usize) -> Self {
        Self::with_depths(sources, sinks, DEFAULT_FIFO_DEPTH, DEFAULT_FIFO_DEPTH)
    }

    /// Creates a cascade with explicit source/sink FIFO depths.
    pub fn with_depths(sources: usize, sinks: usize, src_depth: usize, snk_depth: usize) -> Self {
        assert!(sources >= sinks, "cascade requires sources >= sinks");
        let ratio = (sources + sinks - 1) / sinks;
        Self {
            inner: Buffered::new(sources, sinks, src_depth, snk_depth),
            ratio,
            arbiters: (0..sinks).map(|_| RoundRobinArbiter::new(ratio)).collect(),
        }
    }

    /// Moves at most one payload into each sink, round-robin over its
    /// assigned sources, then re-evaluates port flags.
    pub fn clock(&mut self) {
        for source in 0..self.inner.src.len() {
            if self.inner.src[source].is_empty() {
                continue;
            }
            self.arbiters[source / self.ratio].add(source % self.ratio);
        }

        for sink in 0..self.inner.snk.len() {
            if self.inner.sink_full(sink) || self.arbiters[sink].num_pending() == 0 {
                continue;
            }
            let local = self.arbiters[sink].grant().expect("pending checked above");
            let source = sink * self.ratio + local;
            self.inner.transfer(source, sink);
            self.arbiters[sink].remove(local);
        }

        self.inner.refresh_flags();
    }

    four_op_contract!();
}

/// Fan-out from M sources to N sinks (M <= N) with per-payload routing.
///
/// Each source owns a contiguous band of `ceil(N/M)` sinks; the sink
/// function must stay inside the band, which is asserted.
pub struct Decascade<T> {
    inner: Buffered<T>,
    ratio: usize,
}

impl<T> Decascade<T> {
    /// Creates a decascade with default FIFO depths.
    pub fn new(sources: usize, sinks: usize) -> Self {
        Self::with_depths(sources, sinks, DEFAULT_FIFO_DEPTH, DEFAULT_FIFO_DEPTH)
    }

    /// Creates a decascade with explicit source/sink FIFO depths.
    pub fn with_depths(sources: usize, sinks: usize, src_depth: usize, snk_depth: usize) -> Self {
        assert!(sources <= sinks, "decascade requires sources <= sinks");
        let ratio = (sinks + sources - 1) / sources;
        Self {
            inner: Buffered::new(sources, sinks, src_depth, snk_depth),
            ratio,
        }
    }

    /// Routes the head payload of every source to its chosen sink.
    ///
    /// # Arguments
    ///
    /// * `get_sink` - Per-payload sink selector; must route each source into
    ///   its own sink band.
    pub fn clock<F: FnMut(&T) -> usize>(&mut self, mut get_sink: F) {
        for source in 0..self.inner.src.len() {
            let Some(front) = self.inner.src[source].front() else {
                continue;
            };
            let sink = get_sink(front);
            assert!(
                sink / self.ratio == source,
                "decascade sink {sink} outside source {source} band"
            );
            if self.inner.sink_full(sink) {
                continue;
            }
            self.inner.transfer(source, sink);
        }

        self.inner.refresh_flags();
    }

    four_op_contract!();
}

/// Full any-to-any switch with per-sink round-robin arbitration.
pub struct Crossbar<T> {
    inner: Buffered<T>,
    arbiters: Vec<RoundRobinArbiter>,
}

impl<T> Crossbar<T> {
    /// Creates a crossbar with default FIFO depths.
    pub fn new(sources: usize, sinks: usize) -> Self {
        Self::with_depths(sources, sinks, DEFAULT_FIFO_DEPTH, DEFAULT_FIFO_DEPTH)
    }

    /// Creates a crossbar with explicit source/sink FIFO depths.
    pub fn with_depths(sources: usize, sinks: usize, src_depth: usize, snk_depth: usize) -> Self {
        Self {
            inner: Buffered::new(sources, sinks, src_depth, snk_depth),
            arbiters: (0..sinks).map(|_| RoundRobinArbiter::new(sources)).collect(),
        }
    }

    /// Runs one arbitration round: every source bids for its target sink,
    /// then every sink with room grants one source.
    pub fn clock<F: FnMut(&T) -> usize>(&mut self, mut get_sink: F) {
        for source in 0..self.inner.src.len() {
            let Some(front) = self.inner.src[source].front() else {
                continue;
            };
            self.arbiters[get_sink(front)].add(source);
        }

        for sink in 0..self.inner.snk.len() {
            if self.inner.sink_full(sink) || self.arbiters[sink].num_pending() == 0 {
                continue;
            }
            let source = self.arbiters[sink].grant().expect("pending checked above");
            self.arbiters[sink].remove(source);
            self.inner.transfer(source, sink);
        }

        self.inner.refresh_flags();
    }

    four_op_contract!();
}

/// Crossbar built as an M -> w_src -> w_sink -> N three-stage network.
///
/// Externally identical to [`Crossbar`]; internally the input cascade bounds
/// each middle arbiter to `ceil(M / w_src)` clients and the output stage
/// bounds fan-out to `ceil(N / w_sink)` sinks per arbiter.
pub struct CascadedCrossbar<T> {
    inner: Buffered<T>,
    input_ratio: usize,
    output_ratio: usize,
    cascade_arbiters: Vec<RoundRobinArbiter>,
    crossbar_arbiters: Vec<RoundRobinArbiter>,
}

impl<T> CascadedCrossbar<T> {
    /// Creates a cascaded crossbar with the given internal widths and
    /// default FIFO depths of 64 (the shape used between ports and banks).
    pub fn new(sources: usize, sinks: usize, src_width: usize, snk_width: usize) -> Self {
        Self::with_depths(sources, sinks, src_width, snk_width, 64, 64)
    }

    /// Creates a cascaded crossbar with explicit FIFO depths.
    pub fn with_depths(
        sources: usize,
        sinks: usize,
        src_width: usize,
        snk_width: usize,
        src_depth: usize,
        snk_depth: usize,
    ) -> Self {
        let src_width = src_width.min(sources).max(1);
        let snk_width = snk_width.min(sinks).max(1);
        let input_ratio = (sources + src_width - 1) / src_width;
        let output_ratio = (sinks + snk_width - 1) / snk_width;
        Self {
            inner: Buffered::new(sources, sinks, src_depth, snk_depth),
            input_ratio,
            output_ratio,
            cascade_arbiters: (0..src_width)
                .map(|_| RoundRobinArbiter::new(input_ratio))
                .collect(),
            crossbar_arbiters: (0..snk_width)
                .map(|_| RoundRobinArbiter::new(src_width))
                .collect(),
        }
    }

    /// Runs one three-stage arbitration round.
    ///
    /// Input cascades each pick a source, the middle crossbar matches
    /// cascades to output arbiters, and each output arbiter with room moves
    /// one payload. A payload refused by a full sink keeps its grant for the
    /// next tick.
    pub fn clock<F: FnMut(&T) -> usize>(&mut self, mut get_sink: F) {
        for source in 0..self.inner.src.len() {
            if self.inner.src[source].is_empty() {
                continue;
            }
            self.cascade_arbiters[source / self.input_ratio].add(source % self.input_ratio);
        }

        for cascade in 0..self.cascade_arbiters.len() {
            if self.cascade_arbiters[cascade].num_pending() == 0 {
                continue;
            }
            let local = self.cascade_arbiters[cascade].grant().expect("pending checked");
            let source = cascade * self.input_ratio + local;
            let sink = get_sink(self.inner.src[source].front().expect("pending source empty"));
            self.crossbar_arbiters[sink / self.output_ratio].add(cascade);
        }

        for xbar in 0..self.crossbar_arbiters.len() {
            if self.crossbar_arbiters[xbar].num_pending() == 0 {
                continue;
            }
            let cascade = self.crossbar_arbiters[xbar].grant().expect("pending checked");
            let local = self.cascade_arbiters[cascade].grant().expect("cascade grant lost");
            let source = cascade * self.input_ratio + local;
            let sink = get_sink(self.inner.src[source].front().expect("pending source empty"));
            if self.inner.sink_full(sink) {
                continue;
            }
            self.crossbar_arbiters[xbar].remove(cascade);
            self.cascade_arbiters[cascade].remove(local);
            self.inner.transfer(source, sink);
        }

        self.inner.refresh_flags();
    }

    four_op_contract!();
}

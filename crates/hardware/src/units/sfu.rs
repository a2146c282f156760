//! Fixed-latency special-function-unit pool.
//!
//! Clients write opaque requests on their port; a cascade funnels them into
//! one of N identical pipelines, and completed requests decascade back to
//! the issuing port after the configured latency. The payload is never
//! interpreted.

use crate::mem::transaction::SfuRequest;
use crate::net::{Cascade, Decascade, Pipeline};
use crate::sim::Unit;

/// Pool of identical fixed-latency execution pipelines.
pub struct UnitSfu {
    request_cascade: Cascade<SfuRequest>,
    pipelines: Vec<Pipeline<SfuRequest>>,
    return_cascade: Decascade<SfuRequest>,
}

impl UnitSfu {
    /// Creates a pool.
    ///
    /// # Arguments
    ///
    /// * `num_pipelines` - Parallel execution pipelines.
    /// * `latency` - Ticks from accept to completion.
    /// * `num_clients` - Client ports.
    pub fn new(num_pipelines: usize, latency: u32, num_clients: usize) -> Self {
        Self {
            request_cascade: Cascade::new(num_clients, num_pipelines),
            pipelines: (0..num_pipelines).map(|_| Pipeline::new(latency)).collect(),
            return_cascade: Decascade::new(num_pipelines, num_clients),
        }
    }

    /// Returns `true` when `port` can accept a request this tick. Clock
    /// fall only.
    pub fn request_port_write_valid(&self, port: usize) -> bool {
        self.request_cascade.is_write_valid(port)
    }

    /// Writes a request on the port it names. Clock fall only.
    pub fn write_request(&mut self, request: SfuRequest) {
        self.request_cascade.write(request, request.port as usize);
    }

    /// Returns `true` when `port` holds a completion. Clock rise only.
    pub fn return_port_read_valid(&self, port: usize) -> bool {
        self.return_cascade.is_read_valid(port)
    }

    /// Returns a reference to the completion at `port`. Clock rise only.
    pub fn peek_return(&self, port: usize) -> &SfuRequest {
        self.return_cascade.peek(port)
    }

    /// Removes and returns the completion at `port`. Clock rise only.
    pub fn read_return(&mut self, port: usize) -> SfuRequest {
        self.return_cascade.read(port)
    }
}

impl Unit for UnitSfu {
    fn clock_rise(&mut self) {
        self.request_cascade.clock();

        for (index, pipeline) in self.pipelines.iter_mut().enumerate() {
            if self.request_cascade.is_read_valid(index) && pipeline.is_write_valid() {
                pipeline.write(self.request_cascade.read(index));
            }
        }
    }

    fn clock_fall(&mut self) {
        for (index, pipeline) in self.pipelines.iter_mut().enumerate() {
            if pipeline.is_read_valid() && self.return_cascade.is_write_valid(index) {
                let done = pipeline.read();
                self.return_cascade.write(done, index);
            }
            pipeline.clock();
        }

        self.return_cascade.clock(|req: &SfuRequest| req.port as usize);
    }
}

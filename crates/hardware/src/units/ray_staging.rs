//! TM-resident ray staging buffer.
//!
//! Sits between one TM's clients (the streaming RT core and the TPs) and
//! the stream scheduler. Downstream it double-buffers ray buckets: while
//! the front bucket hands work items out one per request, the back bucket
//! fills from the scheduler's block-sized DRAM returns. Upstream it
//! forwards work-item stores and reports bucket completion once every ray
//! of a delivered bucket has asked for its next work item.
//!
//! A size-0 return from the scheduler marks termination: the buffer
//! fabricates a bucket of invalid-segment work items so every requesting
//! slot can retire.

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use super::stream_scheduler::UnitStreamScheduler;
use crate::common::bits::BitStack58;
use crate::mem::ports::MemUnit;
use crate::mem::transaction::{MemOp, MemoryRequest, MemoryReturn};
use crate::net::{Cascade, FifoArray};
use crate::rt::treelet::{
    BucketRay, RayBucket, StreamRequest, WorkItem, BUCKET_BYTES, INVALID_SEGMENT,
};
use crate::rt::Ray;
use crate::sim::Unit;

struct BucketBuffer {
    image: Box<[u8; BUCKET_BYTES]>,
    bytes_returned: usize,
    requested: bool,
    next_ray: usize,
    bucket: Option<RayBucket>,
    terminated: bool,
}

impl BucketBuffer {
    fn new() -> Self {
        Self {
            image: Box::new([0; BUCKET_BYTES]),
            bytes_returned: 0,
            requested: false,
            next_ray: 0,
            bucket: None,
            terminated: false,
        }
    }

    fn is_filled(&self) -> bool {
        self.bytes_returned == BUCKET_BYTES
    }

    fn num_rays(&self) -> usize {
        if self.terminated {
            RayBucket::MAX_RAYS
        } else {
            self.bucket.as_ref().map_or(0, RayBucket::len)
        }
    }

    fn reset(&mut self) {
        self.bytes_returned = 0;
        self.requested = false;
        self.next_ray = 0;
        self.bucket = None;
        self.terminated = false;
    }
}

#[derive(Default)]
struct SegmentRays {
    active_rays: u32,
    active_buckets: u32,
}

/// TM-side staging between the streaming cores and the stream scheduler.
pub struct UnitRayStagingBuffer {
    request_network: Cascade<MemoryRequest>,
    return_network: FifoArray<MemoryReturn>,

    stream_scheduler: Rc<RefCell<UnitStreamScheduler>>,
    tm_index: u16,

    buffers: [BucketBuffer; 2],
    front: usize,
    filling: usize,

    segment_rays: BTreeMap<u32, SegmentRays>,
    thread_segment: BTreeMap<(u16, u64), u32>,
    completed_buckets: VecDeque<u32>,
    workitem_waiters: VecDeque<(u16, u64)>,

    pending: Option<MemoryRequest>,
}

impl UnitRayStagingBuffer {
    /// Creates the staging buffer for TM `tm_index` with `num_ports`
    /// client ports.
    pub fn new(
        num_ports: usize,
        tm_index: u16,
        stream_scheduler: Rc<RefCell<UnitStreamScheduler>>,
    ) -> Self {
        Self {
            request_network: Cascade::new(num_ports, 1),
            return_network: FifoArray::new(num_ports, 1),
            stream_scheduler,
            tm_index,
            buffers: [BucketBuffer::new(), BucketBuffer::new()],
            front: 0,
            filling: 1,
            segment_rays: BTreeMap::new(),
            thread_segment: BTreeMap::new(),
            completed_buckets: VecDeque::new(),
            workitem_waiters: VecDeque::new(),
            pending: None,
        }
    }

    fn read_scheduler_returns(&mut self) {
        let readable = self
            .stream_scheduler
            .borrow()
            .return_port_read_valid(self.tm_index as usize);
        if !readable {
            return;
        }
        let ret = self
            .stream_scheduler
            .borrow_mut()
            .read_return(self.tm_index as usize);
        let buffer = &mut self.buffers[self.filling];

        if ret.size == 0 {
            buffer.bytes_returned = BUCKET_BYTES;
            buffer.terminated = true;
            return;
        }

        let at = (ret.paddr % BUCKET_BYTES as u64) as usize;
        buffer.image[at..at + ret.size as usize].copy_from_slice(ret.payload());
        buffer.bytes_returned += ret.size as usize;
        if buffer.is_filled() {
            buffer.bucket = Some(RayBucket::from_bytes(&buffer.image));
        }
    }

    fn issue_requests(&mut self) {
        // Rotate: a drained front buffer retires once its sibling has
        // filled, and a filled filling buffer moves on to the empty slot.
        let other = (self.front + 1) % 2;
        if self.buffers[other].is_filled() && self.buffers[self.front].next_ray >= self.buffers[self.front].num_rays()
        {
            self.buffers[self.front].reset();
            self.front = other;
        }
        let next_fill = (self.filling + 1) % 2;
        if self.buffers[self.filling].is_filled() && self.buffers[next_fill].bytes_returned == 0 {
            self.filling = next_fill;
        }

        let writable = self
            .stream_scheduler
            .borrow()
            .stream_port_write_valid(self.tm_index as usize);
        if !writable {
            return;
        }

        if !self.buffers[self.filling].requested {
            // The back buffer is free: ask for its next bucket.
            self.stream_scheduler
                .borrow_mut()
                .write_stream_request(StreamRequest::LoadBucket {
                    port: self.tm_index,
                });
            self.buffers[self.filling].next_ray = 0;
            self.buffers[self.filling].requested = true;
            return;
        }

        if let Some(request) = self.pending {
            if request.op == MemOp::Store && request.size as usize == WorkItem::BYTES {
                let item = WorkItem::read_from(request.payload());
                self.stream_scheduler
                    .borrow_mut()
                    .write_stream_request(StreamRequest::StoreWorkItem {
                        port: self.tm_index,
                        item,
                    });
                self.pending = None;
                return;
            }
        }

        if let Some(&segment) = self.completed_buckets.front() {
            self.stream_scheduler
                .borrow_mut()
                .write_stream_request(StreamRequest::BucketComplete {
                    port: self.tm_index,
                    segment,
                });
            let _ = self.completed_buckets.pop_front();
        }
    }

    fn issue_returns(&mut self) {
        // A work-item load retires the thread's previous work item.
        if let Some(request) = self.pending {
            if request.op == MemOp::Load && request.size as usize == WorkItem::BYTES {
                let thread = (request.port, request.dst.raw());
                self.workitem_waiters.push_back(thread);
                if let Some(segment) = self.thread_segment.remove(&thread) {
                    if segment != INVALID_SEGMENT {
                        let rays = self
                            .segment_rays
                            .get_mut(&segment)
                            .expect("thread retired a ray of an unknown segment");
                        rays.active_rays -= 1;
                        if rays.active_rays == 0 {
                            for _ in 0..rays.active_buckets {
                                self.completed_buckets.push_back(segment);
                            }
                            let _ = self.segment_rays.remove(&segment);
                        }
                    }
                }
                self.pending = None;
            }
        }

        let front = &self.buffers[self.front];
        if self.workitem_waiters.is_empty() || front.next_ray >= front.num_rays() {
            return;
        }
        let (port, dst) = *self.workitem_waiters.front().expect("nonempty checked");
        if !self.return_network.is_write_valid(port as usize) {
            return;
        }
        let _ = self.workitem_waiters.pop_front();

        let item = if front.terminated {
            WorkItem {
                bray: BucketRay {
                    ray: Ray::default(),
                    id: 0,
                },
                segment: INVALID_SEGMENT,
                order_hint: 0,
            }
        } else {
            let bucket = front.bucket.as_ref().expect("filled front has a bucket");
            WorkItem {
                bray: bucket.rays()[front.next_ray],
                segment: bucket.segment,
                order_hint: 0,
            }
        };

        let first_of_bucket = front.next_ray == 0;
        let rays_in_bucket = front.num_rays() as u32;
        self.buffers[self.front].next_ray += 1;

        if item.segment != INVALID_SEGMENT {
            if first_of_bucket {
                let rays = self.segment_rays.entry(item.segment).or_default();
                rays.active_buckets += 1;
                rays.active_rays += rays_in_bucket;
            }
            let _ = self.thread_segment.insert((port, dst), item.segment);
        }

        let mut ret = MemoryReturn::empty(port);
        ret.size = WorkItem::BYTES as u8;
        ret.dst = BitStack58::from_raw(dst);
        let mut bytes = [0u8; WorkItem::BYTES];
        item.write_to(&mut bytes);
        ret.data[..WorkItem::BYTES].copy_from_slice(&bytes);
        self.return_network.write(ret, port as usize);
    }
}

impl Unit for UnitRayStagingBuffer {
    fn clock_rise(&mut self) {
        self.request_network.clock();

        if self.pending.is_none() && self.request_network.is_read_valid(0) {
            self.pending = Some(self.request_network.read(0));
        }

        self.read_scheduler_returns();
    }

    fn clock_fall(&mut self) {
        self.issue_requests();
        self.issue_returns();
        self.return_network.clock();
    }
}

impl MemUnit for UnitRayStagingBuffer {
    fn request_port_write_valid(&self, port: usize) -> bool {
        self.request_network.is_write_valid(port)
    }

    fn write_request(&mut self, request: MemoryRequest) {
        self.request_network.write(request, request.port as usize);
    }

    fn return_port_read_valid(&self, port: usize) -> bool {
        self.return_network.is_read_valid(port)
    }

    fn peek_return(&self, port: usize) -> &MemoryReturn {
        self.return_network.peek(port)
    }

    fn read_return(&mut self, port: usize) -> MemoryReturn {
        self.return_network.read(port)
    }
}

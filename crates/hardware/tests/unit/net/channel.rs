//! Pipelines, FIFOs, and register arrays.

use raysim_core::net::{Fifo, FifoArray, Pipeline, RegisterArray};

#[test]
fn pipeline_enforces_latency() {
    // Latency L means L - 1 shifts to the head; the write tick and the
    // consumer's read tick account for the rest of the L-tick budget.
    let mut pipe: Pipeline<u32> = Pipeline::new(3);
    assert!(pipe.is_write_valid());
    pipe.write(7);
    pipe.clock();
    assert!(!pipe.is_read_valid());
    pipe.clock();
    assert!(pipe.is_read_valid());
    assert_eq!(*pipe.peek(), 7);
    assert_eq!(pipe.read(), 7);
    assert!(pipe.is_empty());
}

#[test]
fn pipeline_accepts_sparse_traffic() {
    let mut pipe: Pipeline<u32> = Pipeline::new(4);
    pipe.write(1);
    pipe.clock();
    pipe.clock();
    // The tail is free again while the first payload is still in flight.
    assert!(pipe.is_write_valid());
    pipe.write(2);
    pipe.clock();
    pipe.clock();
    assert_eq!(pipe.read(), 1);
    pipe.clock();
    pipe.clock();
    assert_eq!(pipe.read(), 2);
}

#[test]
fn pipeline_head_holds_until_read() {
    let mut pipe: Pipeline<u32> = Pipeline::new(2);
    pipe.write(1);
    pipe.clock();
    pipe.write(2);
    pipe.clock();
    assert!(pipe.is_read_valid());
    // Not reading the head must not lose it or reorder the follower.
    pipe.clock();
    pipe.clock();
    assert_eq!(pipe.read(), 1);
    pipe.clock();
    assert_eq!(pipe.read(), 2);
}

#[test]
fn pipeline_backpressures_when_full() {
    let mut pipe: Pipeline<u32> = Pipeline::new(1);
    pipe.write(1);
    assert!(!pipe.is_write_valid());
    pipe.clock();
    assert_eq!(pipe.read(), 1);
    assert!(pipe.is_write_valid());
}

#[test]
fn fifo_contract() {
    let mut fifo: Fifo<u8> = Fifo::new(2);
    assert!(!fifo.is_read_valid());
    fifo.write(1);
    fifo.write(2);
    assert!(!fifo.is_write_valid());
    assert_eq!(*fifo.peek(), 1);
    assert_eq!(fifo.read(), 1);
    assert!(fifo.is_write_valid());
    assert_eq!(fifo.read(), 2);
}

#[test]
fn register_array_pending_clears_on_read() {
    let mut regs: RegisterArray<u8> = RegisterArray::new(2);
    regs.write(5, 0);
    // Not visible to the reader until the next clock.
    assert!(!regs.is_read_valid(0));
    assert!(!regs.is_write_valid(0));
    regs.clock();
    assert!(regs.is_read_valid(0));
    assert_eq!(regs.read(0), 5);
    assert!(regs.is_write_valid(0));
    assert!(!regs.is_read_valid(1));
}

#[test]
fn fifo_array_ports_are_independent() {
    let mut fifos: FifoArray<u8> = FifoArray::new(2, 1);
    fifos.write(1, 0);
    fifos.clock();
    assert!(fifos.is_read_valid(0));
    assert!(!fifos.is_read_valid(1));
    // Depth 1: port 0 is now full, port 1 still open.
    assert!(!fifos.is_write_valid(0));
    assert!(fifos.is_write_valid(1));
    assert_eq!(fifos.read(0), 1);
    fifos.clock();
    assert!(fifos.is_write_valid(0));
}

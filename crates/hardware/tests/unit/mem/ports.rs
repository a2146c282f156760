//! Address map resolution.

use std::cell::RefCell;
use std::rc::Rc;

use raysim_core::mem::ports::{MemHandle, MemoryMap};

use crate::common::mocks::memory::MockMemory;

fn mock() -> MemHandle {
    Rc::new(RefCell::new(MockMemory::new(64, 1, 1)))
}

#[test]
fn ranges_resolve_to_the_registered_unit() {
    let a = mock();
    let b = mock();

    let mut map = MemoryMap::default();
    map.add_unit(0x0000, Some(a.clone()), 0, 4);
    map.add_unit(0x8000, Some(b.clone()), 0, 2);
    map.add_unit(0xC000, None, 0, 0);

    assert!(Rc::ptr_eq(&map.mapping(0x0000).unit, &a));
    assert!(Rc::ptr_eq(&map.mapping(0x7FFF).unit, &a));
    assert!(Rc::ptr_eq(&map.mapping(0x8000).unit, &b));
    assert!(map.mapping_index(0xC000).is_none());
    assert_eq!(map.total_ports, 6);
}

#[test]
fn repeated_windows_share_one_mapping() {
    let a = mock();
    let mut map = MemoryMap::default();
    map.add_unit(0x0000, Some(a.clone()), 0, 4);
    map.add_unit(0x4000, Some(a.clone()), 0, 4);
    assert_eq!(map.mappings.len(), 1);
    assert_eq!(map.total_ports, 4);
}

#[test]
fn port_ids_partition_across_mappings() {
    let a = mock();
    let b = mock();
    let mut map = MemoryMap::default();
    map.add_unit(0x0000, Some(a), 0, 4);
    map.add_unit(0x8000, Some(b), 0, 2);
    assert_eq!(map.mapping_index_for_port(0), 0);
    assert_eq!(map.mapping_index_for_port(3), 0);
    assert_eq!(map.mapping_index_for_port(4), 1);
    assert_eq!(map.mapping_index_for_port(5), 1);
}

#[test]
#[should_panic(expected = "unmapped physical address")]
fn holes_are_fatal_on_strict_lookup() {
    let map = MemoryMap::default();
    let _ = map.mapping(0x42);
}

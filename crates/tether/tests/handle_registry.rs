use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::Arc;

use tether::{NativeCell, NativeItem, NativeProxy, SlotRegistry};

#[derive(Clone)]
struct Widget {
    id: u32,
    alive: Cell<bool>,
}

impl Widget {
    fn new(id: u32) -> Self {
        Self {
            id,
            alive: Cell::new(true),
        }
    }
}

impl NativeItem for Widget {
    fn is_valid(&self) -> bool {
        self.alive.get()
    }
}

fn registry() -> Arc<SlotRegistry> {
    Arc::new(SlotRegistry::new(true))
}

#[test]
fn handle_resolves_while_cell_lives() {
    let reg = registry();
    let cell = NativeCell::new(&reg, Widget::new(7));
    let handle = cell.handle();

    let resolved = reg.resolve(&handle).expect("live cell should resolve");
    assert_eq!(unsafe { resolved.as_ref() }.id, 7);
    assert!(reg.is_live(&handle));
}

#[test]
fn handle_goes_stale_when_cell_drops() {
    let reg = registry();
    let cell = NativeCell::new(&reg, Widget::new(1));
    let handle = cell.handle();
    drop(cell);

    assert!(reg.resolve(&handle).is_none());
    assert!(!reg.is_live(&handle));
}

#[test]
fn recycled_slot_does_not_resurrect_old_handle() {
    let reg = registry();
    let first = NativeCell::new(&reg, Widget::new(1));
    let old = first.handle();
    drop(first);

    let second = NativeCell::new(&reg, Widget::new(2));
    let new = second.handle();

    // LIFO free list hands the same slot back with a fresh generation.
    assert_eq!(old.raw().index, new.raw().index);
    assert_ne!(old.raw().generation, new.raw().generation);

    assert!(reg.resolve(&old).is_none());
    let resolved = reg.resolve(&new).expect("new occupant should resolve");
    assert_eq!(unsafe { resolved.as_ref() }.id, 2);
}

#[test]
fn invalid_item_filters_out_of_resolve() {
    let reg = registry();
    let cell = NativeCell::new(&reg, Widget::new(3));
    let handle = cell.handle();

    assert!(reg.resolve(&handle).is_some());
    cell.get().alive.set(false);
    assert!(reg.resolve(&handle).is_none());
    cell.get().alive.set(true);
    assert!(reg.resolve(&handle).is_some());
}

#[test]
fn cloning_a_cell_registers_a_distinct_identity() {
    let reg = registry();
    let a = NativeCell::new(&reg, Widget::new(4));
    let b = a.clone();

    assert_ne!(a.handle(), b.handle());
    drop(a);
    assert!(reg.resolve(&b.handle()).is_some());
}

struct Outer {
    payload: u64,
    attached: bool,
}

#[test]
fn proxy_forwards_to_outer_object() {
    let reg = registry();
    let mut outer = Outer {
        payload: 99,
        attached: true,
    };
    let proxy = unsafe { NativeProxy::new(&reg, NonNull::from(&mut outer), |o| o.attached) };
    let handle = proxy.handle();

    let resolved = reg.resolve(&handle).expect("attached outer should resolve");
    assert_eq!(unsafe { resolved.as_ref() }.payload, 99);

    outer.attached = false;
    assert!(reg.resolve(&handle).is_none());
    outer.attached = true;

    drop(proxy);
    assert!(reg.resolve(&handle).is_none());
}

#[test]
fn handles_do_not_cross_registries() {
    let reg_a = registry();
    let reg_b = registry();
    let cell = NativeCell::new(&reg_a, Widget::new(5));
    let handle = cell.handle();

    assert!(reg_a.resolve(&handle).is_some());
    assert!(reg_b.resolve(&handle).is_none());
}

#[test]
fn many_cells_round_trip() {
    let reg = registry();
    let cells: Vec<_> = (0..1000).map(|i| NativeCell::new(&reg, Widget::new(i))).collect();
    for (i, cell) in cells.iter().enumerate() {
        let resolved = reg.resolve(&cell.handle()).expect("every cell resolves");
        assert_eq!(unsafe { resolved.as_ref() }.id, i as u32);
    }
}

use std::sync::Arc;

use tether::{
    Comparison, EmbeddedTracer, GcBridge, GcPhase, HostCollector, HostObjectPtr, HostReflect,
    Kind, RawHandle, RuntimeConfig, ScriptDelegate, ScriptRuntime, Traceable, ValueError,
};

struct MockTracer {
    roots: Vec<RawHandle>,
    weak_slots: Vec<*mut HostObjectPtr>,
    collect_calls: usize,
}

impl MockTracer {
    fn new() -> Self {
        Self {
            roots: Vec::new(),
            weak_slots: Vec::new(),
            collect_calls: 0,
        }
    }
}

// Slots handed to the tracer in these tests live on the test stack for the
// whole cycle.
unsafe impl EmbeddedTracer for MockTracer {
    fn collect(&mut self) {
        self.collect_calls += 1;
    }

    fn for_each_root(&mut self, visit: &mut dyn FnMut(Traceable)) {
        for root in &self.roots {
            visit(Traceable::Box(*root));
        }
        for slot in &self.weak_slots {
            visit(Traceable::HostObject {
                slot: *slot,
                strong: false,
            });
        }
    }
}

#[derive(Default)]
struct MockCollector {
    strong: Vec<usize>,
    weak: Vec<usize>,
}

impl HostCollector for MockCollector {
    fn add_strong(&mut self, obj: HostObjectPtr) {
        self.strong.push(obj as usize);
    }

    fn add_weak_for_clearing(&mut self, slot: *mut HostObjectPtr) {
        self.weak.push(slot as usize);
    }
}

struct ClassStub {
    ident: usize,
}

impl HostReflect for ClassStub {
    fn ident(&self) -> usize {
        self.ident
    }
    fn name(&self) -> &str {
        "ClassStub"
    }
    fn size(&self) -> usize {
        size_of::<HostObjectPtr>()
    }
    fn align(&self) -> usize {
        align_of::<HostObjectPtr>()
    }
    unsafe fn init_default(&self, dst: *mut u8) {
        unsafe { dst.cast::<HostObjectPtr>().write(std::ptr::null_mut()) };
    }
    unsafe fn copy(&self, dst: *mut u8, src: *const u8) {
        unsafe { *dst.cast::<HostObjectPtr>() = *src.cast::<HostObjectPtr>() };
    }
    unsafe fn destroy(&self, _ptr: *mut u8) {}
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> Comparison {
        if unsafe { *a.cast::<HostObjectPtr>() == *b.cast::<HostObjectPtr>() } {
            Comparison::Equal
        } else {
            Comparison::NotEqual
        }
    }
    unsafe fn hash(&self, ptr: *const u8) -> Option<u64> {
        Some(unsafe { *ptr.cast::<HostObjectPtr>() } as usize as u64)
    }
}

fn runtime() -> ScriptRuntime {
    ScriptRuntime::new(RuntimeConfig::default())
}

#[test]
fn cycle_sweeps_unrooted_boxes() {
    let rt = runtime();
    let int32 = rt.types().acquire_primitive(Kind::Int32).unwrap();
    let kept = rt.new_value(&int32).unwrap();
    let lost_a = rt.new_value(&int32).unwrap();
    let lost_b = rt.new_value(&int32).unwrap();
    assert_eq!(rt.live_box_count(), 3);

    let mut tracer = MockTracer::new();
    tracer.roots.push(kept.raw());
    let mut collector = MockCollector::default();
    let mut bridge = GcBridge::new();
    assert_eq!(bridge.phase(), GcPhase::Idle);

    let stats = bridge.run_cycle(&rt, &mut tracer, &mut collector);
    assert_eq!(bridge.phase(), GcPhase::Idle);
    assert_eq!(tracer.collect_calls, 1);
    assert_eq!(stats.marked, 1);
    assert_eq!(stats.swept, 2);
    assert_eq!(rt.live_box_count(), 1);

    assert!(rt.with_value_ptr(kept, |_, _| ()).is_ok());
    assert!(matches!(
        rt.with_value_ptr(lost_a, |_, _| ()),
        Err(ValueError::BadHandle)
    ));
    assert!(matches!(
        rt.with_value_ptr(lost_b, |_, _| ()),
        Err(ValueError::BadHandle)
    ));

    // Swept slots go back on the free list. The next box reuses the most
    // recently freed slot under a fresh generation, and the old handle
    // stays dead.
    let successor = rt.new_value(&int32).unwrap();
    assert_eq!(rt.live_box_count(), 2);
    assert_eq!(successor.raw().index, lost_b.raw().index);
    assert_ne!(successor.raw().generation, lost_b.raw().generation);
    assert!(rt.with_value_ptr(successor, |_, _| ()).is_ok());
    assert!(matches!(
        rt.with_value_ptr(lost_b, |_, _| ()),
        Err(ValueError::BadHandle)
    ));
}

#[test]
fn rooted_class_values_pin_their_host_objects() {
    let rt = runtime();
    let host: Arc<dyn HostReflect> = Arc::new(ClassStub { ident: 0x4001 });
    let class = rt.types().acquire_leaf(Kind::ClassType, &host).unwrap();
    let boxed = rt.new_value(&class).unwrap();

    let mut target = 7u64;
    let obj = (&mut target as *mut u64).cast::<()>();
    rt.with_value_ptr(boxed, |ptr, _| unsafe {
        *ptr.cast::<HostObjectPtr>() = obj;
    })
    .unwrap();

    let mut tracer = MockTracer::new();
    tracer.roots.push(boxed.raw());
    let mut collector = MockCollector::default();
    GcBridge::new().run_cycle(&rt, &mut tracer, &mut collector);

    assert_eq!(collector.strong, vec![obj as usize]);
}

#[test]
fn alias_roots_keep_their_owner_alive() {
    let rt = runtime();
    let vec3 = rt.types().acquire_primitive(Kind::Vec3).unwrap();
    let f64_desc = rt.types().acquire_primitive(Kind::Float64).unwrap();
    let parent = rt.new_value(&vec3).unwrap();
    let child = rt.alias_field(parent, &f64_desc, 8).unwrap();

    let mut tracer = MockTracer::new();
    tracer.roots.push(child.raw());
    let mut collector = MockCollector::default();
    let stats = GcBridge::new().run_cycle(&rt, &mut tracer, &mut collector);

    assert_eq!(stats.marked, 2);
    assert_eq!(stats.swept, 0);
    assert!(rt.with_value_ptr(child, |_, _| ()).is_ok());
    assert!(rt.with_value_ptr(parent, |_, _| ()).is_ok());
}

#[test]
fn delegate_targets_survive_through_their_holder() {
    let rt = runtime();
    let host: Arc<dyn HostReflect> = Arc::new(ClassStub { ident: 0x4002 });
    let signature = rt.types().acquire_leaf(Kind::FunctionType, &host).unwrap();
    let delegate = rt
        .types()
        .acquire_composite(Kind::Delegate, &[signature])
        .unwrap();
    let int32 = rt.types().acquire_primitive(Kind::Int32).unwrap();

    let target = rt.new_value(&int32).unwrap();
    let holder = rt.new_value(&delegate).unwrap();
    rt.with_value_ptr(holder, |ptr, _| unsafe {
        *ptr.cast::<ScriptDelegate>() = ScriptDelegate {
            target: target.raw(),
            method: 0xfeed,
        };
    })
    .unwrap();

    let mut tracer = MockTracer::new();
    tracer.roots.push(holder.raw());
    let mut collector = MockCollector::default();
    let stats = GcBridge::new().run_cycle(&rt, &mut tracer, &mut collector);

    assert_eq!(stats.marked, 2);
    assert!(rt.with_value_ptr(target, |_, _| ()).is_ok());
}

#[test]
fn weak_host_slots_are_reported_for_clearing() {
    let rt = runtime();
    let mut referent = 3u64;
    let mut slot: HostObjectPtr = (&mut referent as *mut u64).cast();

    let mut tracer = MockTracer::new();
    tracer.weak_slots.push(&mut slot);
    let mut collector = MockCollector::default();
    GcBridge::new().run_cycle(&rt, &mut tracer, &mut collector);

    assert!(collector.strong.is_empty());
    assert_eq!(collector.weak, vec![std::ptr::addr_of_mut!(slot) as usize]);
}

#[test]
fn cycle_evicts_dead_descriptor_leaves() {
    let rt = runtime();
    let host: Arc<dyn HostReflect> = Arc::new(ClassStub { ident: 0x4003 });
    rt.types().acquire_leaf(Kind::ClassType, &host).unwrap();
    assert_eq!(rt.types().leaf_count(), 1);
    drop(host);

    let mut tracer = MockTracer::new();
    let mut collector = MockCollector::default();
    GcBridge::new().run_cycle(&rt, &mut tracer, &mut collector);
    assert_eq!(rt.types().leaf_count(), 0);
}

#[test]
fn back_to_back_cycles_are_stable() {
    let rt = runtime();
    let int32 = rt.types().acquire_primitive(Kind::Int32).unwrap();
    let kept = rt.new_value(&int32).unwrap();

    let mut tracer = MockTracer::new();
    tracer.roots.push(kept.raw());
    let mut collector = MockCollector::default();
    let mut bridge = GcBridge::new();

    for _ in 0..3 {
        let stats = bridge.run_cycle(&rt, &mut tracer, &mut collector);
        assert_eq!(stats.marked, 1);
        assert_eq!(stats.swept, 0);
    }
    assert!(rt.with_value_ptr(kept, |_, _| ()).is_ok());
}

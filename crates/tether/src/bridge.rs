//! Bridged collection across the two heaps.
//!
//! Neither collector may free the other's objects, so a bridge cycle runs
//! the embedded collector first, then marks every box the embedded side
//! still reaches, reports the host objects those boxes pin, and finally
//! sweeps the boxes nothing reached. Host-object lifetimes stay entirely on
//! the host side; the bridge only tells it what must survive.

use crate::core::descriptor::{HostCollector, HostObjectPtr};
use crate::core::handle::RawHandle;
use crate::runtime::ScriptRuntime;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum GcPhase {
    Idle,
    Marking,
    Sweeping,
}

/// Something the embedded side reports as reachable.
pub enum Traceable {
    /// A value box, marked and traversed by the bridge.
    Box(RawHandle),
    /// A host object pointer held outside any box. `strong` pins the
    /// referent; otherwise the slot is handed to the host for in-place
    /// clearing if the referent dies.
    HostObject {
        slot: *mut HostObjectPtr,
        strong: bool,
    },
}

/// Embedded-collector hooks driving a bridge cycle.
///
/// # Safety
/// Every `HostObject` slot reported by `for_each_root` must point at a live
/// `HostObjectPtr` that stays valid until the cycle ends.
pub unsafe trait EmbeddedTracer {
    /// Run a full embedded collection so pending finalizers release their
    /// boxes before marking starts.
    fn collect(&mut self);

    /// Report every root the embedded side still reaches.
    fn for_each_root(&mut self, visit: &mut dyn FnMut(Traceable));
}

#[derive(Clone, Copy, Debug, Default)]
pub struct CycleStats {
    pub marked: usize,
    pub swept: usize,
}

/// Drives mark/sweep over one runtime's box table.
pub struct GcBridge {
    phase: GcPhase,
}

impl GcBridge {
    pub fn new() -> Self {
        Self {
            phase: GcPhase::Idle,
        }
    }

    pub fn phase(&self) -> GcPhase {
        self.phase
    }

    /// Runs one full cycle: embedded collect, mark from the reported roots,
    /// report pinned host objects to `collector`, sweep unmarked boxes, and
    /// drop descriptor-cache entries the host collection orphaned.
    pub fn run_cycle(
        &mut self,
        runtime: &ScriptRuntime,
        tracer: &mut dyn EmbeddedTracer,
        collector: &mut dyn HostCollector,
    ) -> CycleStats {
        let _guard = runtime.enter();

        self.phase = GcPhase::Marking;
        tracer.collect();
        runtime.clear_marks();

        let mut pending: Vec<RawHandle> = Vec::new();
        tracer.for_each_root(&mut |root| match root {
            Traceable::Box(raw) => pending.push(raw),
            Traceable::HostObject { slot, strong } => {
                // Valid per the EmbeddedTracer contract.
                let obj = unsafe { *slot };
                if obj.is_null() {
                    return;
                }
                if strong {
                    collector.add_strong(obj);
                } else {
                    collector.add_weak_for_clearing(slot);
                }
            }
        });

        let mut marked = 0;
        while let Some(raw) = pending.pop() {
            runtime.with_box(raw, |boxed, registry| {
                if boxed.is_marked() {
                    return;
                }
                boxed.set_marked(true);
                marked += 1;
                boxed.for_each_script_ref(registry, &mut |h| pending.push(h));
                boxed.collect_host_refs(registry, collector);
            });
        }

        self.phase = GcPhase::Sweeping;
        let swept = runtime.sweep_unmarked();
        runtime.types().sweep_after_host_collect();

        self.phase = GcPhase::Idle;
        log::trace!("bridge cycle marked {marked}, swept {swept}");
        CycleStats { marked, swept }
    }
}

impl Default for GcBridge {
    fn default() -> Self {
        Self::new()
    }
}

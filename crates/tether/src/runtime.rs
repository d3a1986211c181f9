//! Per-instance runtime state.
//!
//! A [`ScriptRuntime`] owns everything one embedded script heap needs to
//! hold host-typed values: the handle registry, the descriptor registry,
//! and the table of value boxes the script side references. Nothing here is
//! process-global; two runtimes never share slots, descriptors, or boxes.

use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::core::descriptor::{Kind, RawSeq, TypeDesc};
use crate::core::handle::{Handle, NativeCell, RawHandle, SlotRegistry};
use crate::core::registry::TypeRegistry;
use crate::core::sync::{ReentrantGuard, ReentrantLock, SpinLock};
use crate::core::value::ValueBox;
use crate::core::{FastHashMap, fast_map_new};
use crate::errors::ValueError;

struct BoxTable {
    all: Vec<Option<NativeCell<ValueBox>>>,
    free: Vec<u32>,
    index_of: FastHashMap<RawHandle, u32>,
}

pub struct ScriptRuntime {
    registry: Arc<SlotRegistry>,
    types: TypeRegistry,
    boxes: SpinLock<BoxTable>,
    heap: ReentrantLock,
    config: RuntimeConfig,
}

impl ScriptRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self {
            registry: Arc::new(SlotRegistry::new(config.strict_handles)),
            types: TypeRegistry::new(),
            boxes: SpinLock::new(BoxTable {
                all: Vec::new(),
                free: Vec::new(),
                index_of: fast_map_new(),
            }),
            heap: ReentrantLock::new(),
            config,
        }
    }

    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn handles(&self) -> &Arc<SlotRegistry> {
        &self.registry
    }

    pub fn types(&self) -> &TypeRegistry {
        &self.types
    }

    /// Takes the heap lock. Re-entry from the same thread nests; script
    /// callbacks that call back into the runtime stay deadlock-free.
    pub fn enter(&self) -> ReentrantGuard<'_> {
        self.heap.lock()
    }

    /// Allocates an empty box and registers it for handle access.
    pub fn new_box(&self) -> Handle<ValueBox> {
        let cell = NativeCell::new(&self.registry, ValueBox::new());
        let handle = cell.handle();
        let mut table = self.boxes.lock();
        let index = match table.free.pop() {
            Some(index) => {
                table.all[index as usize] = Some(cell);
                index
            }
            None => {
                let index = table.all.len() as u32;
                table.all.push(Some(cell));
                index
            }
        };
        table.index_of.insert(handle.raw(), index);
        handle
    }

    /// Allocates a box holding a default value of `desc`.
    pub fn new_value(&self, desc: &Arc<TypeDesc>) -> Result<Handle<ValueBox>, ValueError> {
        let _guard = self.enter();
        let handle = self.new_box();
        match self.with_box_mut(handle.raw(), |b, _| b.init_default(Arc::clone(desc))) {
            Some(Ok(())) => Ok(handle),
            Some(Err(err)) => {
                self.drop_box(handle);
                Err(err)
            }
            None => Err(ValueError::BadHandle),
        }
    }

    /// Releases a box: its data is destroyed and its slot recycled, so every
    /// outstanding handle to it goes stale.
    pub fn drop_box(&self, handle: Handle<ValueBox>) -> bool {
        let _guard = self.enter();
        let mut table = self.boxes.lock();
        let Some(index) = table.index_of.remove(&handle.raw()) else {
            return false;
        };
        table.all[index as usize] = None;
        table.free.push(index);
        true
    }

    /// Rebuilds the box with a default value of `desc`.
    pub fn init_value(
        &self,
        handle: Handle<ValueBox>,
        desc: &Arc<TypeDesc>,
    ) -> Result<(), ValueError> {
        let _guard = self.enter();
        self.with_box_mut(handle.raw(), |b, _| b.init_default(Arc::clone(desc)))
            .ok_or(ValueError::BadHandle)?
    }

    /// Destroys the box's data without releasing the box itself.
    pub fn destroy_value(&self, handle: Handle<ValueBox>) -> Result<(), ValueError> {
        let _guard = self.enter();
        self.with_box_mut(handle.raw(), |b, _| b.destroy_data())
            .ok_or(ValueError::BadHandle)
    }

    /// Clone-assigns `src`'s value over `dst`'s. Both must hold data of the
    /// same interned descriptor.
    pub fn copy_value(
        &self,
        dst: Handle<ValueBox>,
        src: Handle<ValueBox>,
    ) -> Result<(), ValueError> {
        let _guard = self.enter();
        if dst == src {
            let boxed = unsafe { self.registry.get(&dst) }.ok_or(ValueError::BadHandle)?;
            boxed.desc().ok_or(ValueError::NoData)?;
            boxed.data_ptr(&self.registry).ok_or(ValueError::StaleData)?;
            return Ok(());
        }
        let src_box = unsafe { self.registry.get(&src) }.ok_or(ValueError::BadHandle)?;
        self.with_box_mut(dst.raw(), |dst_box, registry| {
            dst_box.copy_value_from(src_box, registry)?;
            // A sequence copy rebuilds the destination's elements in place
            // and may move its buffer; views into it must go stale.
            if dst_box.desc().is_some_and(|d| d.has_element_storage()) {
                dst_box.bump_version();
            }
            Ok(())
        })
        .ok_or(ValueError::BadHandle)?
    }

    pub fn value_equal(
        &self,
        a: Handle<ValueBox>,
        b: Handle<ValueBox>,
    ) -> crate::core::descriptor::Comparison {
        let _guard = self.enter();
        let (Some(ba), Some(bb)) = (unsafe { self.registry.get(&a) }, unsafe {
            self.registry.get(&b)
        }) else {
            return crate::core::descriptor::Comparison::Incomparable;
        };
        ba.value_equal(bb, &self.registry)
    }

    pub fn value_hash(&self, handle: Handle<ValueBox>) -> Option<u64> {
        let _guard = self.enter();
        unsafe { self.registry.get(&handle) }?.value_hash(&self.registry)
    }

    /// Runs `f` with a raw pointer to the box's live data and its
    /// descriptor. The pointer is valid only for the duration of `f`.
    pub fn with_value_ptr<R>(
        &self,
        handle: Handle<ValueBox>,
        f: impl FnOnce(*mut u8, &Arc<TypeDesc>) -> R,
    ) -> Result<R, ValueError> {
        let _guard = self.enter();
        let boxed = unsafe { self.registry.get(&handle) }.ok_or(ValueError::BadHandle)?;
        let desc = boxed.desc().ok_or(ValueError::NoData)?;
        let ptr = match boxed.data_ptr(&self.registry) {
            Some(ptr) => ptr,
            // A broken alias chain is stale; a box that simply holds no
            // bytes (a zero-size value) has no data to point at.
            None if boxed.is_alias() => return Err(ValueError::StaleData),
            None => return Err(ValueError::NoData),
        };
        Ok(f(ptr, desc))
    }

    /// Creates a box aliasing `desc`-typed data at `offset` bytes into
    /// `parent`'s value. Meant for struct fields; the offset must come from
    /// the host's layout for the parent type.
    pub fn alias_field(
        &self,
        parent: Handle<ValueBox>,
        desc: &Arc<TypeDesc>,
        offset: usize,
    ) -> Result<Handle<ValueBox>, ValueError> {
        let _guard = self.enter();
        let (data, version) = {
            let pbox = unsafe { self.registry.get(&parent) }.ok_or(ValueError::BadHandle)?;
            let pdesc = pbox.desc().ok_or(ValueError::NoData)?;
            let len = pdesc.size();
            let size = desc.size();
            let in_range = offset
                .checked_add(size)
                .is_some_and(|end| end <= len);
            if !in_range {
                return Err(ValueError::OffsetOutOfRange { offset, size, len });
            }
            let ptr = pbox.data_ptr(&self.registry).ok_or(ValueError::StaleData)?;
            (unsafe { ptr.add(offset) }, pbox.version())
        };
        let child = self.new_box();
        self.with_box_mut(child.raw(), |b, _| {
            b.bind_alias(Arc::clone(desc), parent, version, data)
        });
        Ok(child)
    }

    /// Creates a box aliasing element `index` of an Array-typed parent.
    pub fn alias_element(
        &self,
        parent: Handle<ValueBox>,
        index: usize,
    ) -> Result<Handle<ValueBox>, ValueError> {
        let _guard = self.enter();
        let (desc, data, version) = {
            let pbox = unsafe { self.registry.get(&parent) }.ok_or(ValueError::BadHandle)?;
            let pdesc = pbox.desc().ok_or(ValueError::NoData)?;
            if pdesc.kind() != Kind::Array {
                return Err(ValueError::NotAnArray(pdesc.to_string()));
            }
            let ptr = pbox.data_ptr(&self.registry).ok_or(ValueError::StaleData)?;
            let seq = unsafe { &*ptr.cast::<RawSeq>() };
            if index >= seq.len() {
                return Err(ValueError::IndexOutOfRange {
                    index,
                    len: seq.len(),
                });
            }
            let stride = pdesc.elem_layout().size();
            let elem = unsafe { seq.elem_ptr(index, stride) };
            (Arc::clone(&pdesc.subs()[0]), elem, pbox.version())
        };
        let child = self.new_box();
        self.with_box_mut(child.raw(), |b, _| b.bind_alias(desc, parent, version, data));
        Ok(child)
    }

    /// Appends a default-constructed element to an Array-typed value and
    /// returns the new length.
    pub fn array_push_default(&self, handle: Handle<ValueBox>) -> Result<usize, ValueError> {
        let _guard = self.enter();
        self.with_box_mut(handle.raw(), |boxed, registry| {
            let desc = boxed.desc().cloned().ok_or(ValueError::NoData)?;
            if desc.kind() != Kind::Array {
                return Err(ValueError::NotAnArray(desc.to_string()));
            }
            let ptr = boxed.data_ptr(registry).ok_or(ValueError::StaleData)?;
            let layout = desc.elem_layout();
            let seq = unsafe { &mut *ptr.cast::<RawSeq>() };
            let moved = seq.reserve(layout, 1);
            let len = seq.len();
            unsafe {
                let slot = seq.elem_ptr(len, layout.size());
                desc.subs()[0].init_value(slot);
            }
            seq.set_len(len + 1);
            if moved {
                // The old element buffer is gone; strand views into it.
                boxed.bump_version();
            }
            Ok(len + 1)
        })
        .ok_or(ValueError::BadHandle)?
    }

    pub fn array_len(&self, handle: Handle<ValueBox>) -> Result<usize, ValueError> {
        let _guard = self.enter();
        self.with_value_ptr(handle, |ptr, desc| {
            if desc.kind() != Kind::Array {
                return Err(ValueError::NotAnArray(desc.to_string()));
            }
            Ok(unsafe { &*ptr.cast::<RawSeq>() }.len())
        })?
    }

    pub fn live_box_count(&self) -> usize {
        let table = self.boxes.lock();
        table.all.len() - table.free.len()
    }

    pub(crate) fn with_box<R>(
        &self,
        raw: RawHandle,
        f: impl FnOnce(&ValueBox, &SlotRegistry) -> R,
    ) -> Option<R> {
        let handle: Handle<ValueBox> = Handle::from_raw(raw);
        let boxed = unsafe { self.registry.get(&handle) }?;
        Some(f(boxed, &self.registry))
    }

    pub(crate) fn with_box_mut<R>(
        &self,
        raw: RawHandle,
        f: impl FnOnce(&mut ValueBox, &SlotRegistry) -> R,
    ) -> Option<R> {
        let mut table = self.boxes.lock();
        let index = *table.index_of.get(&raw)? as usize;
        let cell = table.all[index].as_mut()?;
        Some(f(cell.get_mut(), &self.registry))
    }

    pub(crate) fn clear_marks(&self) {
        let table = self.boxes.lock();
        for cell in table.all.iter().flatten() {
            cell.get().set_marked(false);
        }
    }

    /// Releases every unmarked box. Returns how many were swept.
    pub(crate) fn sweep_unmarked(&self) -> usize {
        let mut table = self.boxes.lock();
        let mut swept = 0;
        for index in 0..table.all.len() {
            let Some(cell) = table.all[index].as_ref() else {
                continue;
            };
            if cell.get().is_marked() {
                continue;
            }
            let raw = cell.handle().raw();
            table.index_of.remove(&raw);
            table.all[index] = None;
            table.free.push(index as u32);
            swept += 1;
        }
        if swept > 0 {
            log::debug!("swept {swept} unreachable value boxes");
        }
        swept
    }
}

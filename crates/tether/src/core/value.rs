//! Boxed script-visible values.
//!
//! A [`ValueBox`] pairs an interned descriptor with storage for one value.
//! Small values live in a fixed inline buffer, large ones on the heap, and a
//! box may instead alias a sub-range of another box's data. Every time a
//! box's data is destroyed or rebuilt its version is bumped, so aliases into
//! it go stale instead of dangling.

use std::alloc::{self, Layout, handle_alloc_error};
use std::cell::{Cell, UnsafeCell};
use std::mem::MaybeUninit;
use std::ptr::NonNull;
use std::sync::Arc;

use super::descriptor::{Comparison, HostCollector, TypeDesc};
use super::handle::{Handle, NativeItem, RawHandle, SlotRegistry};
use crate::errors::ValueError;

/// Values at most this large (and at most [`MAX_INLINE_ALIGN`]-aligned)
/// stay in the inline buffer.
pub const MAX_INLINE_SIZE: usize = 256;
pub const MAX_INLINE_ALIGN: usize = 16;

#[repr(C, align(16))]
struct InlineBuf([MaybeUninit<u8>; MAX_INLINE_SIZE]);

enum Storage {
    Empty,
    /// Value lives in the inline buffer.
    Inline,
    /// Value lives in a dedicated allocation. The layout is captured at
    /// allocation time; a descriptor whose host side dies later would
    /// otherwise report the wrong layout at free time.
    Heap { ptr: *mut u8, layout: Layout },
    /// View into another box's data. `owner_version` snapshots the owner's
    /// version at bind time; any rebuild of the owner invalidates the view.
    Alias {
        owner: Handle<ValueBox>,
        owner_version: u64,
        data: *mut u8,
    },
}

pub struct ValueBox {
    desc: Option<Arc<TypeDesc>>,
    storage: Storage,
    buf: UnsafeCell<InlineBuf>,
    version: u64,
    marked: Cell<bool>,
}

// Data is only reached through a runtime that serializes access behind its
// heap lock.
unsafe impl Send for ValueBox {}
unsafe impl Sync for ValueBox {}

impl NativeItem for ValueBox {}

impl ValueBox {
    pub fn new() -> Self {
        Self {
            desc: None,
            storage: Storage::Empty,
            buf: UnsafeCell::new(InlineBuf([MaybeUninit::uninit(); MAX_INLINE_SIZE])),
            version: 0,
            marked: Cell::new(false),
        }
    }

    pub fn desc(&self) -> Option<&Arc<TypeDesc>> {
        self.desc.as_ref()
    }

    /// Version counter; bumped whenever the data is destroyed or rebuilt.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Strands every view bound to this box. Called whenever owned storage
    /// is replaced in place, such as a sequence buffer reallocating.
    pub(crate) fn bump_version(&mut self) {
        self.version += 1;
    }

    pub fn is_alias(&self) -> bool {
        matches!(self.storage, Storage::Alias { .. })
    }

    pub fn owns_data(&self) -> bool {
        matches!(self.storage, Storage::Inline | Storage::Heap { .. })
    }

    fn inline_ptr(&self) -> *mut u8 {
        self.buf.get().cast()
    }

    /// Builds a default value of `desc`, replacing whatever the box held.
    pub fn init_default(&mut self, desc: Arc<TypeDesc>) -> Result<(), ValueError> {
        if desc.is_dead_leaf() {
            return Err(ValueError::DeadType(desc.to_string()));
        }
        self.destroy_data();
        let layout = desc.layout();
        self.storage = if layout.size() == 0 {
            // Zero-size values carry no state and get no storage; data_ptr
            // stays None and every data operation is a no-op.
            Storage::Empty
        } else if layout.size() <= MAX_INLINE_SIZE && layout.align() <= MAX_INLINE_ALIGN {
            unsafe { desc.init_value(self.inline_ptr()) };
            Storage::Inline
        } else {
            let ptr = unsafe { alloc::alloc(layout) };
            if ptr.is_null() {
                handle_alloc_error(layout);
            }
            unsafe { desc.init_value(ptr) };
            Storage::Heap { ptr, layout }
        };
        self.desc = Some(desc);
        Ok(())
    }

    /// Binds the box to a view into another box's data. `data` must point
    /// into storage owned (directly or through further aliases) by the box
    /// `owner` resolves to, at a value of type `desc`; `owner_version` is
    /// the owner's version at the time `data` was computed.
    pub(crate) fn bind_alias(
        &mut self,
        desc: Arc<TypeDesc>,
        owner: Handle<ValueBox>,
        owner_version: u64,
        data: *mut u8,
    ) {
        self.destroy_data();
        self.storage = Storage::Alias {
            owner,
            owner_version,
            data,
        };
        self.desc = Some(desc);
    }

    /// Tears down the box's data and bumps the version so views into this
    /// box go stale. Alias storage drops only the view, never the data.
    pub fn destroy_data(&mut self) {
        match std::mem::replace(&mut self.storage, Storage::Empty) {
            Storage::Inline => {
                if let Some(desc) = &self.desc {
                    unsafe { desc.destroy_value(self.inline_ptr()) };
                }
            }
            Storage::Heap { ptr, layout } => {
                if let Some(desc) = &self.desc {
                    unsafe { desc.destroy_value(ptr) };
                }
                unsafe { alloc::dealloc(ptr, layout) };
            }
            Storage::Alias { .. } | Storage::Empty => {}
        }
        self.desc = None;
        self.version += 1;
    }

    /// Pointer to the live data, or `None` when the box is empty or its
    /// alias chain has gone stale. Alias validity re-checks the whole chain.
    pub fn data_ptr(&self, registry: &SlotRegistry) -> Option<*mut u8> {
        match &self.storage {
            Storage::Empty => None,
            Storage::Inline => Some(self.inline_ptr()),
            Storage::Heap { ptr, .. } => Some(*ptr),
            Storage::Alias {
                owner,
                owner_version,
                data,
            } => {
                // Boxes are only reached under the runtime heap lock, which
                // keeps the owner registered for the duration of the borrow.
                let owner_box = unsafe { registry.get(owner)? };
                if owner_box.version != *owner_version {
                    return None;
                }
                owner_box.data_ptr(registry)?;
                Some(*data)
            }
        }
    }

    pub fn has_data(&self, registry: &SlotRegistry) -> bool {
        self.data_ptr(registry).is_some()
    }

    /// Clone-assigns `src`'s value over this box's value. Both boxes must
    /// hold data of the same interned descriptor.
    pub fn copy_value_from(
        &self,
        src: &ValueBox,
        registry: &SlotRegistry,
    ) -> Result<(), ValueError> {
        let desc = self.desc.as_ref().ok_or(ValueError::NoData)?;
        let src_desc = src.desc.as_ref().ok_or(ValueError::NoData)?;
        if !Arc::ptr_eq(desc, src_desc) {
            return Err(ValueError::TypeMismatch {
                expected: desc.to_string(),
                got: src_desc.to_string(),
            });
        }
        if desc.size() == 0 {
            return Ok(());
        }
        let dst_ptr = self.data_ptr(registry).ok_or(ValueError::StaleData)?;
        let src_ptr = src.data_ptr(registry).ok_or(ValueError::StaleData)?;
        if dst_ptr != src_ptr {
            unsafe { desc.copy_value(dst_ptr, src_ptr) };
        }
        Ok(())
    }

    /// Three-way comparison. Boxes of different interned descriptors, or
    /// without live data, are `Incomparable`.
    pub fn value_equal(&self, other: &ValueBox, registry: &SlotRegistry) -> Comparison {
        let (Some(da), Some(db)) = (&self.desc, &other.desc) else {
            return Comparison::Incomparable;
        };
        if !Arc::ptr_eq(da, db) {
            return Comparison::Incomparable;
        }
        if da.size() == 0 {
            // No bytes to compare; the descriptor decides.
            let nowhere = NonNull::<u8>::dangling().as_ptr();
            return unsafe { da.value_equal(nowhere, nowhere) };
        }
        let (Some(pa), Some(pb)) = (self.data_ptr(registry), other.data_ptr(registry)) else {
            return Comparison::Incomparable;
        };
        unsafe { da.value_equal(pa, pb) }
    }

    pub fn value_hash(&self, registry: &SlotRegistry) -> Option<u64> {
        let desc = self.desc.as_ref()?;
        if desc.size() == 0 {
            return unsafe { desc.value_hash(NonNull::<u8>::dangling().as_ptr()) };
        }
        let ptr = self.data_ptr(registry)?;
        unsafe { desc.value_hash(ptr) }
    }

    pub(crate) fn set_marked(&self, marked: bool) {
        self.marked.set(marked);
    }

    pub(crate) fn is_marked(&self) -> bool {
        self.marked.get()
    }

    /// Walks the host objects held by this box's own data. Alias boxes are
    /// skipped; their owner reports the data once.
    pub(crate) fn collect_host_refs(
        &self,
        registry: &SlotRegistry,
        collector: &mut dyn HostCollector,
    ) {
        if !self.owns_data() {
            return;
        }
        if let (Some(desc), Some(ptr)) = (&self.desc, self.data_ptr(registry)) {
            unsafe { desc.collect_host_refs(ptr, collector) };
        }
    }

    /// Walks the strong script handles reachable from this box: the alias
    /// owner, if any, plus delegate targets embedded in owned data.
    pub(crate) fn for_each_script_ref(
        &self,
        registry: &SlotRegistry,
        visit: &mut dyn FnMut(RawHandle),
    ) {
        if let Storage::Alias { owner, .. } = &self.storage {
            visit(owner.raw());
        }
        if !self.owns_data() {
            return;
        }
        if let (Some(desc), Some(ptr)) = (&self.desc, self.data_ptr(registry)) {
            unsafe { desc.collect_script_refs(ptr, visit) };
        }
    }
}

impl Default for ValueBox {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for ValueBox {
    fn drop(&mut self) {
        self.destroy_data();
    }
}

//! Generational slot registry for natively-owned objects.
//!
//! Native objects opt into safe external referencing by anchoring themselves
//! in a [`SlotRegistry`]. A [`Handle`] snapshots the slot index and the
//! generation at registration time; the slot's generation is bumped on every
//! reuse, so a handle captured before the slot was recycled resolves to
//! `None` instead of a dangling pointer.
//!
//! Two anchor shapes avoid any inheritance scheme:
//! - [`NativeCell`] owns the item and registers it directly ("direct mode").
//! - [`NativeProxy`] registers a small composed proxy that forwards validity
//!   to an outer object it points back at ("proxy mode").
//!
//! Both share a `#[repr(C)]` [`AnchorHeader`] prefix carrying probe/deref
//! thunks, so the slot table stores one thin pointer per item.

use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicPtr, AtomicU32, Ordering};

use super::sync::SpinLock;

const SLOTS_PER_CHUNK: usize = 256;
const MAX_CHUNKS: usize = 4096;

const CHECK_TAG_LIVE: u32 = 0xffff_ffff;
const CHECK_TAG_DEAD: u32 = 0;

/// Manually-managed object opting into safe external handles.
pub trait NativeItem {
    /// Liveness filter applied on every resolve. Defaults to always-live;
    /// items with external teardown report their own state here.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Untyped `{slot index, generation snapshot}` pair.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct RawHandle {
    pub index: u32,
    pub generation: i64,
}

impl RawHandle {
    pub const NULL: RawHandle = RawHandle {
        index: u32::MAX,
        generation: -1,
    };

    pub fn is_null(&self) -> bool {
        self.generation < 0
    }
}

/// Typed weak handle to an anchored native object.
pub struct Handle<T> {
    raw: RawHandle,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Handle<T> {
    pub(crate) fn from_raw(raw: RawHandle) -> Self {
        Self {
            raw,
            _marker: PhantomData,
        }
    }

    pub fn raw(&self) -> RawHandle {
        self.raw
    }
}

impl<T> Clone for Handle<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for Handle<T> {}

impl<T> PartialEq for Handle<T> {
    fn eq(&self, other: &Self) -> bool {
        self.raw == other.raw
    }
}
impl<T> Eq for Handle<T> {}

impl<T> std::fmt::Debug for Handle<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Handle")
            .field("index", &self.raw.index)
            .field("generation", &self.raw.generation)
            .finish()
    }
}

type ProbeFn = unsafe fn(*const AnchorHeader) -> bool;
type DerefFn = unsafe fn(*const AnchorHeader) -> *const ();

/// Shared prefix of every registered object. Holds the registration pair the
/// item carries around plus the thunks the registry resolves through.
#[repr(C)]
pub struct AnchorHeader {
    probe: ProbeFn,
    deref: DerefFn,
    check: AtomicU32,
    pair_index: AtomicU32,
    pair_generation: AtomicI64,
}

impl AnchorHeader {
    fn new(probe: ProbeFn, deref: DerefFn) -> Self {
        Self {
            probe,
            deref,
            check: AtomicU32::new(CHECK_TAG_DEAD),
            pair_index: AtomicU32::new(u32::MAX),
            pair_generation: AtomicI64::new(-1),
        }
    }

    fn pair(&self) -> RawHandle {
        RawHandle {
            index: self.pair_index.load(Ordering::Acquire),
            generation: self.pair_generation.load(Ordering::Acquire),
        }
    }
}

/// Stable slot storage. Slots live in fixed chunks that are never moved or
/// freed before the registry itself drops, so concurrent readers may touch
/// them without a lock.
struct Slot {
    generation: AtomicI64,
    busy: AtomicBool,
    target: AtomicPtr<AnchorHeader>,
}

impl Slot {
    fn new() -> Self {
        Self {
            generation: AtomicI64::new(-1),
            busy: AtomicBool::new(false),
            target: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

struct RegistryState {
    len: u32,
    generation: i64,
    free: Vec<u32>,
}

/// Generational handle registry. Writers serialize on one spinlock; resolves
/// are lock-free except a bounded spin against a writer on the same slot.
pub struct SlotRegistry {
    chunks: Box<[AtomicPtr<Slot>]>,
    state: SpinLock<RegistryState>,
    strict: AtomicBool,
}

impl SlotRegistry {
    pub fn new(strict: bool) -> Self {
        let chunks: Vec<AtomicPtr<Slot>> = (0..MAX_CHUNKS)
            .map(|_| AtomicPtr::new(std::ptr::null_mut()))
            .collect();
        Self {
            chunks: chunks.into_boxed_slice(),
            state: SpinLock::new(RegistryState {
                len: 0,
                generation: 0,
                free: Vec::new(),
            }),
            strict: AtomicBool::new(strict),
        }
    }

    pub fn set_strict(&self, strict: bool) {
        self.strict.store(strict, Ordering::Relaxed);
    }

    pub fn strict(&self) -> bool {
        self.strict.load(Ordering::Relaxed)
    }

    fn violation(&self, msg: &str) {
        if self.strict() {
            panic!("slot registry violation: {msg}");
        }
        log::warn!("slot registry violation: {msg}");
    }

    fn slot(&self, index: u32) -> Option<&Slot> {
        let chunk = index as usize / SLOTS_PER_CHUNK;
        let base = self.chunks.get(chunk)?.load(Ordering::Acquire);
        if base.is_null() {
            return None;
        }
        Some(unsafe { &*base.add(index as usize % SLOTS_PER_CHUNK) })
    }

    /// Called under the state lock when `index` is about to be used.
    fn ensure_chunk(&self, index: u32) {
        let chunk = index as usize / SLOTS_PER_CHUNK;
        assert!(chunk < MAX_CHUNKS, "slot registry exhausted");
        if self.chunks[chunk].load(Ordering::Acquire).is_null() {
            let boxed: Box<[Slot; SLOTS_PER_CHUNK]> =
                Box::new(std::array::from_fn(|_| Slot::new()));
            let raw = Box::into_raw(boxed) as *mut Slot;
            self.chunks[chunk].store(raw, Ordering::Release);
        }
    }

    /// Registers `header`, storing the new pair on it. Generation is bumped
    /// on every assignment, so recycled slots invalidate older handles.
    pub(crate) fn assign(&self, header: NonNull<AnchorHeader>) -> RawHandle {
        let mut state = self.state.lock();
        state.generation += 1;
        let generation = state.generation;
        let index = match state.free.pop() {
            Some(index) => index,
            None => {
                let index = state.len;
                state.len += 1;
                self.ensure_chunk(index);
                index
            }
        };

        let h = unsafe { header.as_ref() };
        h.check.store(CHECK_TAG_LIVE, Ordering::Release);
        h.pair_index.store(index, Ordering::Release);
        h.pair_generation.store(generation, Ordering::Release);

        let slot = self.slot(index).expect("chunk was just ensured");
        slot.busy.store(true, Ordering::Release);
        slot.target.store(header.as_ptr(), Ordering::Release);
        slot.generation.store(generation, Ordering::Release);
        slot.busy.store(false, Ordering::Release);

        RawHandle { index, generation }
    }

    /// Clears `header`'s registration and recycles its slot. Double-unsign
    /// and registry mismatches are strict-mode violations.
    pub(crate) fn unsign(&self, header: &AnchorHeader) {
        let state = self.state.lock();
        let index = header.pair_index.load(Ordering::Acquire);
        if index == u32::MAX {
            drop(state);
            self.violation("unsign of an item that is not registered");
            return;
        }
        if header.check.swap(CHECK_TAG_DEAD, Ordering::AcqRel) != CHECK_TAG_LIVE {
            drop(state);
            self.violation("double unsign (check-tag already cleared)");
            return;
        }

        let slot = match self.slot(index) {
            Some(slot) => slot,
            None => {
                drop(state);
                self.violation("unsign pair points at a slot that was never allocated");
                return;
            }
        };
        if !std::ptr::eq(slot.target.load(Ordering::Acquire), header) {
            drop(state);
            self.violation("unsign pair does not match the slot's registered item");
            return;
        }

        slot.busy.store(true, Ordering::Release);
        slot.generation.store(-1, Ordering::Release);
        slot.target.store(std::ptr::null_mut(), Ordering::Release);
        slot.busy.store(false, Ordering::Release);

        header.pair_index.store(u32::MAX, Ordering::Release);
        header.pair_generation.store(-1, Ordering::Release);

        let mut state = state;
        state.free.push(index);
    }

    fn resolve_anchor(&self, raw: RawHandle) -> Option<NonNull<AnchorHeader>> {
        if raw.is_null() {
            return None;
        }
        let slot = self.slot(raw.index)?;
        while slot.busy.load(Ordering::Acquire) {
            std::hint::spin_loop();
        }
        if slot.generation.load(Ordering::Acquire) != raw.generation {
            return None;
        }
        let target = NonNull::new(slot.target.load(Ordering::Acquire))?;
        let header = unsafe { target.as_ref() };
        if header.check.load(Ordering::Acquire) != CHECK_TAG_LIVE {
            // The slot may have been recycled between the generation read and
            // the tag read; only a still-matching generation is a real
            // dereference-after-unsign.
            if slot.generation.load(Ordering::Acquire) == raw.generation {
                self.violation("resolve reached an unsigned item (check-tag mismatch)");
            }
            return None;
        }
        if unsafe { (header.probe)(target.as_ptr()) } {
            Some(target)
        } else {
            None
        }
    }

    /// Resolves a handle to the registered item. Returns `None` for null,
    /// stale, unregistered, or invalid items. The pointer is only safe to
    /// dereference while the item remains registered.
    pub fn resolve<T>(&self, handle: &Handle<T>) -> Option<NonNull<T>> {
        let anchor = self.resolve_anchor(handle.raw)?;
        let item = unsafe { (anchor.as_ref().deref)(anchor.as_ptr()) };
        NonNull::new(item.cast_mut().cast::<T>())
    }

    /// Borrowing resolve.
    ///
    /// # Safety
    /// The caller must guarantee the item is not unregistered or dropped for
    /// the duration of the borrow; within this crate that is guaranteed by
    /// the single-writer heap lock and the sweep's exclusive access.
    pub unsafe fn get<'a, T>(&'a self, handle: &Handle<T>) -> Option<&'a T> {
        self.resolve(handle).map(|p| unsafe { &*p.as_ptr() })
    }

    pub fn is_live<T>(&self, handle: &Handle<T>) -> bool {
        self.resolve_anchor(handle.raw).is_some()
    }
}

impl Drop for SlotRegistry {
    fn drop(&mut self) {
        for chunk in self.chunks.iter() {
            let base = chunk.load(Ordering::Acquire);
            if !base.is_null() {
                drop(unsafe { Box::from_raw(base as *mut [Slot; SLOTS_PER_CHUNK]) });
            }
        }
    }
}

#[repr(C)]
struct CellInner<T> {
    header: AnchorHeader,
    item: T,
}

unsafe fn probe_cell<T: NativeItem>(header: *const AnchorHeader) -> bool {
    let inner = header.cast::<CellInner<T>>();
    unsafe { (*inner).item.is_valid() }
}

unsafe fn deref_cell<T: NativeItem>(header: *const AnchorHeader) -> *const () {
    let inner = header.cast::<CellInner<T>>();
    unsafe { std::ptr::addr_of!((*inner).item).cast() }
}

/// Direct-mode anchor: owns the item, registered for its whole lifetime.
/// Cloning re-registers the copy; identity is never duplicated.
pub struct NativeCell<T: NativeItem> {
    inner: Box<CellInner<T>>,
    registry: Arc<SlotRegistry>,
}

impl<T: NativeItem> NativeCell<T> {
    pub fn new(registry: &Arc<SlotRegistry>, item: T) -> Self {
        let inner = Box::new(CellInner {
            header: AnchorHeader::new(probe_cell::<T>, deref_cell::<T>),
            item,
        });
        registry.assign(NonNull::from(&inner.header));
        Self {
            inner,
            registry: Arc::clone(registry),
        }
    }

    pub fn handle(&self) -> Handle<T> {
        Handle::from_raw(self.inner.header.pair())
    }

    pub fn get(&self) -> &T {
        &self.inner.item
    }

    pub fn get_mut(&mut self) -> &mut T {
        &mut self.inner.item
    }
}

impl<T: NativeItem + Clone> Clone for NativeCell<T> {
    fn clone(&self) -> Self {
        Self::new(&self.registry, self.inner.item.clone())
    }
}

impl<T: NativeItem> Drop for NativeCell<T> {
    fn drop(&mut self) {
        self.registry.unsign(&self.inner.header);
    }
}

#[repr(C)]
struct ProxyInner<O> {
    header: AnchorHeader,
    outer: NonNull<O>,
    valid: fn(&O) -> bool,
}

unsafe fn probe_proxy<O>(header: *const AnchorHeader) -> bool {
    let inner = header.cast::<ProxyInner<O>>();
    unsafe { ((*inner).valid)((*inner).outer.as_ref()) }
}

unsafe fn deref_proxy<O>(header: *const AnchorHeader) -> *const () {
    let inner = header.cast::<ProxyInner<O>>();
    unsafe { (*inner).outer.as_ptr().cast_const().cast() }
}

/// Proxy-mode anchor for outer objects that cannot be owned by a cell. The
/// registered object is always the proxy itself, never the outer object;
/// validity forwards through the back-pointer.
pub struct NativeProxy<O> {
    inner: Box<ProxyInner<O>>,
    registry: Arc<SlotRegistry>,
}

impl<O> NativeProxy<O> {
    /// # Safety
    /// `outer` must stay valid for the proxy's lifetime; the proxy must be
    /// dropped before the outer object is freed.
    pub unsafe fn new(registry: &Arc<SlotRegistry>, outer: NonNull<O>, valid: fn(&O) -> bool) -> Self {
        let inner = Box::new(ProxyInner {
            header: AnchorHeader::new(probe_proxy::<O>, deref_proxy::<O>),
            outer,
            valid,
        });
        registry.assign(NonNull::from(&inner.header));
        Self {
            inner,
            registry: Arc::clone(registry),
        }
    }

    pub fn handle(&self) -> Handle<O> {
        Handle::from_raw(self.inner.header.pair())
    }
}

impl<O> Drop for NativeProxy<O> {
    fn drop(&mut self) {
        self.registry.unsign(&self.inner.header);
    }
}

//! Interned type descriptors and the type-erased value operations they
//! dispatch.
//!
//! A [`TypeDesc`] names one script-visible value shape: a primitive, a
//! composite built from sub-descriptors, or a host-defined leaf backed by a
//! [`HostReflect`] implementation. Descriptors are interned by the registry,
//! so pointer identity doubles as type identity and every operation is a
//! plain `match` on [`Kind`] instead of a vtable.

use std::alloc::{self, Layout, handle_alloc_error};
use std::fmt;
use std::hash::Hash;
use std::ptr::{self, NonNull};
use std::sync::{Arc, Weak};

use smallvec::SmallVec;

use super::handle::RawHandle;

/// Pointer to an object owned by the host object system.
pub type HostObjectPtr = *mut ();

fn hash_one<T: Hash>(value: &T) -> u64 {
    super::fast_hasher().hash_one(value)
}

/// Three-way result of comparing two erased values. `Incomparable` is
/// deliberately distinct from `Equal`: values without equality semantics
/// (formatted text, multicast lists, dead host types) never report equal.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Comparison {
    Equal,
    NotEqual,
    Incomparable,
}

impl Comparison {
    fn from_bool(eq: bool) -> Self {
        if eq { Comparison::Equal } else { Comparison::NotEqual }
    }

    pub fn is_equal(self) -> bool {
        self == Comparison::Equal
    }
}

/// Display-oriented text payload. Carries no collation rules, so values only
/// ever compare as `Incomparable`.
#[derive(Clone, Debug, Default)]
pub struct FormattedText(pub String);

/// Bound call target: a script-side receiver plus an interned method name.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct ScriptDelegate {
    pub target: RawHandle,
    pub method: u64,
}

impl ScriptDelegate {
    pub const UNBOUND: ScriptDelegate = ScriptDelegate {
        target: RawHandle::NULL,
        method: 0,
    };
}

/// Host object viewed through one of its interfaces.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub struct ScriptInterface {
    pub object: HostObjectPtr,
    pub iface: HostObjectPtr,
}

impl ScriptInterface {
    pub const NULL: ScriptInterface = ScriptInterface {
        object: ptr::null_mut(),
        iface: ptr::null_mut(),
    };
}

/// Sink for host references discovered while walking erased values.
pub trait HostCollector {
    /// Keep `obj` alive through the host collection.
    fn add_strong(&mut self, obj: HostObjectPtr);
    /// Let `slot` be cleared in place if its referent is collected.
    fn add_weak_for_clearing(&mut self, slot: *mut HostObjectPtr);
}

/// Host-side reflection for a user-defined type. The registry holds these
/// weakly; when the host drops its side the descriptor goes inert instead of
/// dangling.
pub trait HostReflect: Send + Sync {
    /// Stable identity of the host type, used as the interning key.
    fn ident(&self) -> usize;
    fn name(&self) -> &str;
    fn size(&self) -> usize;
    fn align(&self) -> usize;

    /// # Safety
    /// `dst` must point at `size()` writable bytes aligned to `align()`.
    unsafe fn init_default(&self, dst: *mut u8);
    /// # Safety
    /// Both pointers must address initialized values of this type.
    unsafe fn copy(&self, dst: *mut u8, src: *const u8);
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    unsafe fn destroy(&self, ptr: *mut u8);
    /// # Safety
    /// Both pointers must address initialized values of this type.
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> Comparison;
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    unsafe fn hash(&self, ptr: *const u8) -> Option<u64>;

    /// Report the host-pointer fields embedded in a value of this type.
    ///
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    unsafe fn enumerate_refs(&self, ptr: *mut u8, visit: &mut dyn FnMut(*mut HostObjectPtr)) {
        let _ = (ptr, visit);
    }
}

/// Discriminants are banded: primitives below 0x20, composites in 0x20..,
/// user-defined leaves in 0x40.. The bands are what `is_*` test, so new
/// kinds slot in without renumbering.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
#[repr(u32)]
pub enum Kind {
    None = 0x00,
    Int8 = 0x01,
    Int16 = 0x02,
    Int32 = 0x03,
    Int64 = 0x04,
    Byte = 0x05,
    UInt16 = 0x06,
    UInt32 = 0x07,
    UInt64 = 0x08,
    Float32 = 0x09,
    Float64 = 0x0a,
    Bool = 0x0b,
    Str = 0x0c,
    Name = 0x0d,
    Text = 0x0e,
    Vec3 = 0x0f,
    Rotator = 0x10,
    Quat = 0x11,
    Transform = 0x12,
    Matrix = 0x13,
    Color = 0x14,
    LinearColor = 0x15,

    Array = 0x20,
    Map = 0x21,
    Set = 0x22,
    Delegate = 0x23,
    MulticastDelegate = 0x24,
    WeakRef = 0x25,
    Enum = 0x26,

    EnumType = 0x40,
    StructType = 0x41,
    ClassType = 0x42,
    FunctionType = 0x43,
    InterfaceType = 0x44,
}

impl Kind {
    pub fn is_primitive(self) -> bool {
        (self as u32) < 0x20
    }

    pub fn is_composite(self) -> bool {
        (0x20..0x40).contains(&(self as u32))
    }

    pub fn is_user_defined(self) -> bool {
        (self as u32) >= 0x40
    }

    /// Number of sub-descriptors a composite of this kind takes.
    pub(crate) fn arity(self) -> Option<usize> {
        match self {
            Kind::Array | Kind::Set | Kind::WeakRef => Some(1),
            Kind::Map | Kind::Enum => Some(2),
            Kind::Delegate | Kind::MulticastDelegate => Some(1),
            _ => None,
        }
    }

    fn static_name(self) -> &'static str {
        match self {
            Kind::None => "None",
            Kind::Int8 => "Int8",
            Kind::Int16 => "Int16",
            Kind::Int32 => "Int32",
            Kind::Int64 => "Int64",
            Kind::Byte => "Byte",
            Kind::UInt16 => "UInt16",
            Kind::UInt32 => "UInt32",
            Kind::UInt64 => "UInt64",
            Kind::Float32 => "Float32",
            Kind::Float64 => "Float64",
            Kind::Bool => "Bool",
            Kind::Str => "Str",
            Kind::Name => "Name",
            Kind::Text => "Text",
            Kind::Vec3 => "Vec3",
            Kind::Rotator => "Rotator",
            Kind::Quat => "Quat",
            Kind::Transform => "Transform",
            Kind::Matrix => "Matrix",
            Kind::Color => "Color",
            Kind::LinearColor => "LinearColor",
            Kind::Array => "Array",
            Kind::Map => "Map",
            Kind::Set => "Set",
            Kind::Delegate => "Delegate",
            Kind::MulticastDelegate => "MulticastDelegate",
            Kind::WeakRef => "WeakRef",
            Kind::Enum => "Enum",
            Kind::EnumType => "EnumType",
            Kind::StructType => "StructType",
            Kind::ClassType => "ClassType",
            Kind::FunctionType => "FunctionType",
            Kind::InterfaceType => "InterfaceType",
        }
    }
}

/// Weak tie to the host side of a user-defined descriptor.
pub(crate) struct HostLeaf {
    pub(crate) ident: usize,
    pub(crate) reflect: Weak<dyn HostReflect>,
}

/// Interned descriptor of one value shape. Compare and hash by `Arc`
/// identity; the registry guarantees one descriptor per shape.
pub struct TypeDesc {
    kind: Kind,
    subs: SmallVec<[Arc<TypeDesc>; 2]>,
    leaf: Option<HostLeaf>,
}

impl TypeDesc {
    pub(crate) fn primitive(kind: Kind) -> Self {
        debug_assert!(kind.is_primitive());
        Self {
            kind,
            subs: SmallVec::new(),
            leaf: None,
        }
    }

    pub(crate) fn composite(kind: Kind, subs: SmallVec<[Arc<TypeDesc>; 2]>) -> Self {
        debug_assert_eq!(kind.arity(), Some(subs.len()));
        Self {
            kind,
            subs,
            leaf: None,
        }
    }

    pub(crate) fn leaf(kind: Kind, ident: usize, reflect: Weak<dyn HostReflect>) -> Self {
        debug_assert!(kind.is_user_defined());
        Self {
            kind,
            subs: SmallVec::new(),
            leaf: Some(HostLeaf { ident, reflect }),
        }
    }

    pub fn kind(&self) -> Kind {
        self.kind
    }

    pub fn subs(&self) -> &[Arc<TypeDesc>] {
        &self.subs
    }

    pub fn leaf_ident(&self) -> Option<usize> {
        self.leaf.as_ref().map(|l| l.ident)
    }

    fn reflect(&self) -> Option<Arc<dyn HostReflect>> {
        self.leaf.as_ref()?.reflect.upgrade()
    }

    /// A user-defined descriptor whose host side has been dropped. Inert
    /// leaves report size 0 and compare as `Incomparable`.
    pub fn is_dead_leaf(&self) -> bool {
        match &self.leaf {
            Some(leaf) => leaf.reflect.strong_count() == 0,
            None => false,
        }
    }

    pub fn size(&self) -> usize {
        match self.kind {
            Kind::None => 0,
            Kind::Int8 | Kind::Byte | Kind::Bool => 1,
            Kind::Int16 | Kind::UInt16 => 2,
            Kind::Int32 | Kind::UInt32 | Kind::Float32 | Kind::Color => 4,
            Kind::Int64
            | Kind::UInt64
            | Kind::Float64
            | Kind::Name
            | Kind::EnumType => 8,
            Kind::Str => size_of::<String>(),
            Kind::Text => size_of::<FormattedText>(),
            Kind::Vec3 | Kind::Rotator => size_of::<[f64; 3]>(),
            Kind::Quat => size_of::<[f64; 4]>(),
            Kind::Transform => size_of::<[f64; 10]>(),
            Kind::Matrix => size_of::<[[f64; 4]; 4]>(),
            Kind::LinearColor => size_of::<[f32; 4]>(),
            Kind::Array | Kind::Map | Kind::Set => size_of::<RawSeq>(),
            Kind::Delegate => size_of::<ScriptDelegate>(),
            Kind::MulticastDelegate => size_of::<Vec<ScriptDelegate>>(),
            Kind::WeakRef => size_of::<RawHandle>(),
            Kind::Enum => self.subs[1].size(),
            Kind::StructType => self.reflect().map_or(0, |r| r.size()),
            Kind::ClassType | Kind::FunctionType => size_of::<HostObjectPtr>(),
            Kind::InterfaceType => size_of::<ScriptInterface>(),
        }
    }

    pub fn align(&self) -> usize {
        match self.kind {
            Kind::None => 1,
            Kind::Int8 | Kind::Byte | Kind::Bool => 1,
            Kind::Int16 | Kind::UInt16 => 2,
            Kind::Int32 | Kind::UInt32 | Kind::Float32 | Kind::Color | Kind::LinearColor => 4,
            Kind::Int64
            | Kind::UInt64
            | Kind::Float64
            | Kind::Name
            | Kind::EnumType
            | Kind::Vec3
            | Kind::Rotator
            | Kind::Quat
            | Kind::Transform
            | Kind::Matrix => 8,
            Kind::Str => align_of::<String>(),
            Kind::Text => align_of::<FormattedText>(),
            Kind::Array | Kind::Map | Kind::Set => align_of::<RawSeq>(),
            Kind::Delegate => align_of::<ScriptDelegate>(),
            Kind::MulticastDelegate => align_of::<Vec<ScriptDelegate>>(),
            Kind::WeakRef => align_of::<RawHandle>(),
            Kind::Enum => self.subs[1].align(),
            Kind::StructType => self.reflect().map_or(1, |r| r.align()),
            Kind::ClassType | Kind::FunctionType => align_of::<HostObjectPtr>(),
            Kind::InterfaceType => align_of::<ScriptInterface>(),
        }
    }

    pub fn layout(&self) -> Layout {
        // size/align always form a valid layout for the kinds above
        Layout::from_size_align(self.size(), self.align()).expect("descriptor layout")
    }

    /// Element layout and value offset for one Map entry.
    fn pair_layout(&self) -> (Layout, usize) {
        let key = &self.subs[0];
        let value = &self.subs[1];
        let align = key.align().max(value.align());
        let offset = round_up(key.size(), value.align());
        let size = round_up(offset + value.size(), align);
        (
            Layout::from_size_align(size, align).expect("pair layout"),
            offset,
        )
    }

    pub(crate) fn elem_layout(&self) -> Layout {
        match self.kind {
            Kind::Array | Kind::Set => self.subs[0].layout(),
            Kind::Map => self.pair_layout().0,
            _ => unreachable!("not a sequence kind"),
        }
    }

    /// Kinds whose values own a separate element buffer that a copy or a
    /// capacity grow can move or rebuild.
    pub(crate) fn has_element_storage(&self) -> bool {
        matches!(self.kind, Kind::Array | Kind::Map | Kind::Set)
    }

    /// Writes a default value of this type at `dst`.
    ///
    /// # Safety
    /// `dst` must point at `size()` writable bytes aligned to `align()`.
    pub unsafe fn init_value(&self, dst: *mut u8) {
        unsafe {
            match self.kind {
                Kind::Str => dst.cast::<String>().write(String::new()),
                Kind::Text => dst.cast::<FormattedText>().write(FormattedText::default()),
                Kind::Array | Kind::Map | Kind::Set => dst.cast::<RawSeq>().write(RawSeq::new()),
                Kind::Delegate => dst.cast::<ScriptDelegate>().write(ScriptDelegate::UNBOUND),
                Kind::MulticastDelegate => {
                    dst.cast::<Vec<ScriptDelegate>>().write(Vec::new())
                }
                Kind::WeakRef => dst.cast::<RawHandle>().write(RawHandle::NULL),
                Kind::Enum => self.subs[1].init_value(dst),
                Kind::StructType => {
                    if let Some(reflect) = self.reflect() {
                        reflect.init_default(dst);
                    }
                }
                Kind::ClassType | Kind::FunctionType => {
                    dst.cast::<HostObjectPtr>().write(ptr::null_mut())
                }
                Kind::InterfaceType => dst.cast::<ScriptInterface>().write(ScriptInterface::NULL),
                _ => ptr::write_bytes(dst, 0, self.size()),
            }
        }
    }

    /// Clone-assigns `src` over the initialized value at `dst`.
    ///
    /// # Safety
    /// Both pointers must address initialized values of this type and must
    /// not overlap.
    pub unsafe fn copy_value(&self, dst: *mut u8, src: *const u8) {
        unsafe {
            match self.kind {
                Kind::Str => *dst.cast::<String>() = (*src.cast::<String>()).clone(),
                Kind::Text => {
                    *dst.cast::<FormattedText>() = (*src.cast::<FormattedText>()).clone()
                }
                Kind::Array | Kind::Map | Kind::Set => self.seq_assign(dst, src),
                Kind::MulticastDelegate => {
                    *dst.cast::<Vec<ScriptDelegate>>() =
                        (*src.cast::<Vec<ScriptDelegate>>()).clone()
                }
                Kind::Enum => self.subs[1].copy_value(dst, src),
                Kind::StructType => {
                    if let Some(reflect) = self.reflect() {
                        reflect.copy(dst, src);
                    }
                }
                _ => ptr::copy_nonoverlapping(src, dst, self.size()),
            }
        }
    }

    /// Drops the value at `ptr` in place.
    ///
    /// # Safety
    /// `ptr` must address an initialized value of this type; the bytes are
    /// uninitialized afterwards.
    pub unsafe fn destroy_value(&self, ptr: *mut u8) {
        unsafe {
            match self.kind {
                Kind::Str => ptr::drop_in_place(ptr.cast::<String>()),
                Kind::Text => ptr::drop_in_place(ptr.cast::<FormattedText>()),
                Kind::Array | Kind::Map | Kind::Set => {
                    let seq = &mut *ptr.cast::<RawSeq>();
                    self.seq_clear(seq);
                    seq.release(self.elem_layout());
                }
                Kind::MulticastDelegate => {
                    ptr::drop_in_place(ptr.cast::<Vec<ScriptDelegate>>())
                }
                Kind::Enum => self.subs[1].destroy_value(ptr),
                Kind::StructType => {
                    if let Some(reflect) = self.reflect() {
                        reflect.destroy(ptr);
                    }
                }
                _ => {}
            }
        }
    }

    /// Stable hash of the value at `ptr`, or `None` for unhashable kinds.
    ///
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    pub unsafe fn value_hash(&self, ptr: *const u8) -> Option<u64> {
        unsafe {
            match self.kind {
                Kind::None => Some(0),
                Kind::Int8 => Some(hash_one(&*ptr.cast::<i8>())),
                Kind::Int16 => Some(hash_one(&*ptr.cast::<i16>())),
                Kind::Int32 => Some(hash_one(&*ptr.cast::<i32>())),
                Kind::Int64 => Some(hash_one(&*ptr.cast::<i64>())),
                Kind::Byte => Some(hash_one(&*ptr.cast::<u8>())),
                Kind::UInt16 => Some(hash_one(&*ptr.cast::<u16>())),
                Kind::UInt32 => Some(hash_one(&*ptr.cast::<u32>())),
                Kind::UInt64 | Kind::Name => Some(hash_one(&*ptr.cast::<u64>())),
                Kind::Float32 => Some(hash_one(&(*ptr.cast::<f32>()).to_bits())),
                Kind::Float64 => Some(hash_one(&(*ptr.cast::<f64>()).to_bits())),
                Kind::Bool => Some(hash_one(&*ptr.cast::<bool>())),
                Kind::Str => Some(hash_one(&*ptr.cast::<String>())),
                Kind::Text => None,
                Kind::Vec3 | Kind::Rotator => {
                    Some(hash_one(&(*ptr.cast::<[f64; 3]>()).map(f64::to_bits)))
                }
                Kind::Quat => Some(hash_one(&(*ptr.cast::<[f64; 4]>()).map(f64::to_bits))),
                Kind::Transform | Kind::Matrix => None,
                Kind::Color => Some(hash_one(&*ptr.cast::<[u8; 4]>())),
                Kind::LinearColor => {
                    Some(hash_one(&(*ptr.cast::<[f32; 4]>()).map(f32::to_bits)))
                }
                Kind::Array | Kind::Map | Kind::Set => self.seq_hash(&*ptr.cast::<RawSeq>()),
                Kind::Delegate => Some(hash_one(&*ptr.cast::<ScriptDelegate>())),
                Kind::MulticastDelegate => None,
                Kind::WeakRef => Some(hash_one(&*ptr.cast::<RawHandle>())),
                Kind::Enum => self.subs[1].value_hash(ptr),
                Kind::EnumType => Some(hash_one(&*ptr.cast::<i64>())),
                Kind::StructType => self.reflect().and_then(|r| r.hash(ptr)),
                Kind::ClassType | Kind::FunctionType => {
                    Some(hash_one(&(*ptr.cast::<HostObjectPtr>() as usize)))
                }
                Kind::InterfaceType => {
                    let v = *ptr.cast::<ScriptInterface>();
                    Some(hash_one(&(v.object as usize, v.iface as usize)))
                }
            }
        }
    }

    /// Compares two values of this type.
    ///
    /// # Safety
    /// Both pointers must address initialized values of this type.
    pub unsafe fn value_equal(&self, a: *const u8, b: *const u8) -> Comparison {
        unsafe {
            match self.kind {
                Kind::None => Comparison::Equal,
                Kind::Int8 => Comparison::from_bool(*a.cast::<i8>() == *b.cast::<i8>()),
                Kind::Int16 => Comparison::from_bool(*a.cast::<i16>() == *b.cast::<i16>()),
                Kind::Int32 => Comparison::from_bool(*a.cast::<i32>() == *b.cast::<i32>()),
                Kind::Int64 => Comparison::from_bool(*a.cast::<i64>() == *b.cast::<i64>()),
                Kind::Byte => Comparison::from_bool(*a.cast::<u8>() == *b.cast::<u8>()),
                Kind::UInt16 => Comparison::from_bool(*a.cast::<u16>() == *b.cast::<u16>()),
                Kind::UInt32 => Comparison::from_bool(*a.cast::<u32>() == *b.cast::<u32>()),
                Kind::UInt64 | Kind::Name => {
                    Comparison::from_bool(*a.cast::<u64>() == *b.cast::<u64>())
                }
                Kind::Float32 => Comparison::from_bool(*a.cast::<f32>() == *b.cast::<f32>()),
                Kind::Float64 => Comparison::from_bool(*a.cast::<f64>() == *b.cast::<f64>()),
                Kind::Bool => Comparison::from_bool(*a.cast::<bool>() == *b.cast::<bool>()),
                Kind::Str => Comparison::from_bool(*a.cast::<String>() == *b.cast::<String>()),
                Kind::Text => Comparison::Incomparable,
                Kind::Vec3 | Kind::Rotator => {
                    Comparison::from_bool(*a.cast::<[f64; 3]>() == *b.cast::<[f64; 3]>())
                }
                Kind::Quat => {
                    Comparison::from_bool(*a.cast::<[f64; 4]>() == *b.cast::<[f64; 4]>())
                }
                // Host transforms only compare within a tolerance; surfacing a
                // strict bitwise answer here would disagree with it.
                Kind::Transform | Kind::Matrix => Comparison::Incomparable,
                Kind::Color => Comparison::from_bool(*a.cast::<[u8; 4]>() == *b.cast::<[u8; 4]>()),
                Kind::LinearColor => {
                    Comparison::from_bool(*a.cast::<[f32; 4]>() == *b.cast::<[f32; 4]>())
                }
                Kind::Array | Kind::Map | Kind::Set => {
                    self.seq_equal(&*a.cast::<RawSeq>(), &*b.cast::<RawSeq>())
                }
                Kind::Delegate => Comparison::from_bool(
                    *a.cast::<ScriptDelegate>() == *b.cast::<ScriptDelegate>(),
                ),
                Kind::MulticastDelegate => Comparison::Incomparable,
                Kind::WeakRef => {
                    Comparison::from_bool(*a.cast::<RawHandle>() == *b.cast::<RawHandle>())
                }
                Kind::Enum => self.subs[1].value_equal(a, b),
                Kind::EnumType => Comparison::from_bool(*a.cast::<i64>() == *b.cast::<i64>()),
                Kind::StructType => match self.reflect() {
                    Some(reflect) => reflect.compare(a, b),
                    None => Comparison::Incomparable,
                },
                Kind::ClassType | Kind::FunctionType => Comparison::from_bool(
                    *a.cast::<HostObjectPtr>() == *b.cast::<HostObjectPtr>(),
                ),
                Kind::InterfaceType => Comparison::from_bool(
                    *a.cast::<ScriptInterface>() == *b.cast::<ScriptInterface>(),
                ),
            }
        }
    }

    /// Whether values of this type can embed host object pointers.
    pub fn has_host_refs(&self) -> bool {
        match self.kind {
            Kind::ClassType | Kind::FunctionType | Kind::InterfaceType | Kind::StructType => true,
            Kind::Array | Kind::Map | Kind::Set => self.subs.iter().any(|s| s.has_host_refs()),
            _ => false,
        }
    }

    /// Whether values of this type can embed script handles that keep their
    /// targets alive. `WeakRef` is deliberately absent: weak handles are
    /// stale-checked at resolve time instead of pinning their target.
    pub fn has_script_refs(&self) -> bool {
        match self.kind {
            Kind::Delegate | Kind::MulticastDelegate => true,
            Kind::Array | Kind::Map | Kind::Set => self.subs.iter().any(|s| s.has_script_refs()),
            _ => false,
        }
    }

    /// Reports every host object reachable from the value at `ptr`.
    ///
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    pub unsafe fn collect_host_refs(&self, ptr: *mut u8, collector: &mut dyn HostCollector) {
        if !self.has_host_refs() {
            return;
        }
        unsafe {
            match self.kind {
                Kind::ClassType | Kind::FunctionType => {
                    let obj = *ptr.cast::<HostObjectPtr>();
                    if !obj.is_null() {
                        collector.add_strong(obj);
                    }
                }
                Kind::InterfaceType => {
                    let v = *ptr.cast::<ScriptInterface>();
                    if !v.object.is_null() {
                        collector.add_strong(v.object);
                    }
                    if !v.iface.is_null() {
                        collector.add_strong(v.iface);
                    }
                }
                Kind::StructType => {
                    if let Some(reflect) = self.reflect() {
                        reflect.enumerate_refs(ptr, &mut |slot| {
                            let obj = *slot;
                            if !obj.is_null() {
                                collector.add_strong(obj);
                            }
                        });
                    }
                }
                Kind::Array | Kind::Set => {
                    let seq = &*ptr.cast::<RawSeq>();
                    let elem = &self.subs[0];
                    let stride = self.elem_layout().size();
                    for i in 0..seq.len() {
                        elem.collect_host_refs(seq.elem_ptr(i, stride), collector);
                    }
                }
                Kind::Map => {
                    let seq = &*ptr.cast::<RawSeq>();
                    let (layout, value_offset) = self.pair_layout();
                    let stride = layout.size();
                    for i in 0..seq.len() {
                        let pair = seq.elem_ptr(i, stride);
                        self.subs[0].collect_host_refs(pair, collector);
                        self.subs[1].collect_host_refs(pair.add(value_offset), collector);
                    }
                }
                _ => {}
            }
        }
    }

    /// Reports every strong script handle reachable from the value at `ptr`.
    ///
    /// # Safety
    /// `ptr` must address an initialized value of this type.
    pub unsafe fn collect_script_refs(&self, ptr: *const u8, visit: &mut dyn FnMut(RawHandle)) {
        if !self.has_script_refs() {
            return;
        }
        unsafe {
            match self.kind {
                Kind::Delegate => {
                    let d = *ptr.cast::<ScriptDelegate>();
                    if !d.target.is_null() {
                        visit(d.target);
                    }
                }
                Kind::MulticastDelegate => {
                    for d in &*ptr.cast::<Vec<ScriptDelegate>>() {
                        if !d.target.is_null() {
                            visit(d.target);
                        }
                    }
                }
                Kind::Array | Kind::Set => {
                    let seq = &*ptr.cast::<RawSeq>();
                    let elem = &self.subs[0];
                    let stride = self.elem_layout().size();
                    for i in 0..seq.len() {
                        elem.collect_script_refs(seq.elem_ptr(i, stride), visit);
                    }
                }
                Kind::Map => {
                    let seq = &*ptr.cast::<RawSeq>();
                    let (layout, value_offset) = self.pair_layout();
                    let stride = layout.size();
                    for i in 0..seq.len() {
                        let pair = seq.elem_ptr(i, stride);
                        self.subs[0].collect_script_refs(pair, visit);
                        self.subs[1]
                            .collect_script_refs(pair.add(value_offset).cast_const(), visit);
                    }
                }
                _ => {}
            }
        }
    }

    unsafe fn seq_assign(&self, dst: *mut u8, src: *const u8) {
        unsafe {
            let layout = self.elem_layout();
            let stride = layout.size();
            let dst = &mut *dst.cast::<RawSeq>();
            let src = &*src.cast::<RawSeq>();
            self.seq_clear(dst);
            dst.reserve(layout, src.len());
            for i in 0..src.len() {
                let slot = dst.elem_ptr(dst.len(), stride);
                self.seq_init_elem(slot);
                self.seq_copy_elem(slot, src.elem_ptr(i, stride));
                dst.set_len(dst.len() + 1);
            }
        }
    }

    unsafe fn seq_clear(&self, seq: &mut RawSeq) {
        unsafe {
            let stride = self.elem_layout().size();
            for i in 0..seq.len() {
                self.seq_destroy_elem(seq.elem_ptr(i, stride));
            }
            seq.set_len(0);
        }
    }

    unsafe fn seq_init_elem(&self, slot: *mut u8) {
        unsafe {
            match self.kind {
                Kind::Array | Kind::Set => self.subs[0].init_value(slot),
                Kind::Map => {
                    let (_, value_offset) = self.pair_layout();
                    self.subs[0].init_value(slot);
                    self.subs[1].init_value(slot.add(value_offset));
                }
                _ => unreachable!("not a sequence kind"),
            }
        }
    }

    unsafe fn seq_copy_elem(&self, dst: *mut u8, src: *const u8) {
        unsafe {
            match self.kind {
                Kind::Array | Kind::Set => self.subs[0].copy_value(dst, src),
                Kind::Map => {
                    let (_, value_offset) = self.pair_layout();
                    self.subs[0].copy_value(dst, src);
                    self.subs[1].copy_value(dst.add(value_offset), src.add(value_offset));
                }
                _ => unreachable!("not a sequence kind"),
            }
        }
    }

    unsafe fn seq_destroy_elem(&self, slot: *mut u8) {
        unsafe {
            match self.kind {
                Kind::Array | Kind::Set => self.subs[0].destroy_value(slot),
                Kind::Map => {
                    let (_, value_offset) = self.pair_layout();
                    self.subs[0].destroy_value(slot);
                    self.subs[1].destroy_value(slot.add(value_offset));
                }
                _ => unreachable!("not a sequence kind"),
            }
        }
    }

    unsafe fn seq_hash(&self, seq: &RawSeq) -> Option<u64> {
        unsafe {
            let stride = self.elem_layout().size();
            let mut acc = hash_one(&seq.len());
            for i in 0..seq.len() {
                let slot = seq.elem_ptr(i, stride);
                let h = match self.kind {
                    Kind::Array | Kind::Set => self.subs[0].value_hash(slot)?,
                    Kind::Map => {
                        let (_, value_offset) = self.pair_layout();
                        let k = self.subs[0].value_hash(slot)?;
                        let v = self.subs[1].value_hash(slot.add(value_offset))?;
                        k.rotate_left(32) ^ v
                    }
                    _ => unreachable!("not a sequence kind"),
                };
                acc = acc.rotate_left(5).wrapping_mul(0x9e37_79b9_7f4a_7c15) ^ h;
            }
            Some(acc)
        }
    }

    unsafe fn seq_equal(&self, a: &RawSeq, b: &RawSeq) -> Comparison {
        unsafe {
            if a.len() != b.len() {
                return Comparison::NotEqual;
            }
            let stride = self.elem_layout().size();
            let mut result = Comparison::Equal;
            for i in 0..a.len() {
                let pa = a.elem_ptr(i, stride);
                let pb = b.elem_ptr(i, stride);
                let cmp = match self.kind {
                    Kind::Array | Kind::Set => self.subs[0].value_equal(pa, pb),
                    Kind::Map => {
                        let (_, value_offset) = self.pair_layout();
                        match self.subs[0].value_equal(pa, pb) {
                            Comparison::Equal => self.subs[1]
                                .value_equal(pa.add(value_offset), pb.add(value_offset)),
                            other => other,
                        }
                    }
                    _ => unreachable!("not a sequence kind"),
                };
                match cmp {
                    Comparison::Equal => {}
                    Comparison::NotEqual => result = Comparison::NotEqual,
                    Comparison::Incomparable => return Comparison::Incomparable,
                }
                if result == Comparison::NotEqual {
                    return Comparison::NotEqual;
                }
            }
            result
        }
    }
}

impl fmt::Display for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.leaf, self.kind.is_composite()) {
            (Some(leaf), _) => match leaf.reflect.upgrade() {
                Some(reflect) => write!(f, "{}({})", self.kind.static_name(), reflect.name()),
                None => write!(f, "{}(<dropped>)", self.kind.static_name()),
            },
            (None, true) => {
                write!(f, "{}<", self.kind.static_name())?;
                for (i, sub) in self.subs.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{sub}")?;
                }
                write!(f, ">")
            }
            (None, false) => f.write_str(self.kind.static_name()),
        }
    }
}

impl fmt::Debug for TypeDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TypeDesc({self})")
    }
}

const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

/// Type-erased growable buffer backing Array, Map, and Set values. Element
/// layout lives on the descriptor, not here, so every operation that touches
/// elements goes through [`TypeDesc`].
pub struct RawSeq {
    ptr: *mut u8,
    len: usize,
    cap: usize,
}

impl RawSeq {
    pub fn new() -> Self {
        Self {
            ptr: ptr::null_mut(),
            len: 0,
            cap: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub(crate) fn set_len(&mut self, len: usize) {
        debug_assert!(len <= self.cap || self.elem_is_zero_sized());
        self.len = len;
    }

    fn elem_is_zero_sized(&self) -> bool {
        self.ptr.is_null() && self.cap == usize::MAX
    }

    /// Pointer to element `i` given the element stride.
    ///
    /// # Safety
    /// `i < len` and `stride` must be the stride of this sequence's element
    /// layout.
    pub unsafe fn elem_ptr(&self, i: usize, stride: usize) -> *mut u8 {
        debug_assert!(i <= self.len);
        if stride == 0 {
            return NonNull::<u8>::dangling().as_ptr();
        }
        unsafe { self.ptr.add(i * stride) }
    }

    /// Grows capacity so `additional` more elements fit. Returns `true` when
    /// the backing buffer was reallocated; raw views into the old buffer are
    /// invalid afterwards.
    pub(crate) fn reserve(&mut self, elem: Layout, additional: usize) -> bool {
        let stride = elem.size();
        if stride == 0 {
            self.cap = usize::MAX;
            return false;
        }
        let needed = self
            .len
            .checked_add(additional)
            .expect("sequence capacity overflow");
        if needed <= self.cap {
            return false;
        }
        let new_cap = needed.max(self.cap.saturating_mul(2)).max(4);
        let bytes = stride.checked_mul(new_cap).expect("sequence capacity overflow");
        let new_layout =
            Layout::from_size_align(bytes, elem.align()).expect("sequence layout overflow");
        let new_ptr = unsafe {
            if self.cap == 0 {
                alloc::alloc(new_layout)
            } else {
                let old_layout =
                    Layout::from_size_align_unchecked(stride * self.cap, elem.align());
                alloc::realloc(self.ptr, old_layout, new_layout.size())
            }
        };
        if new_ptr.is_null() {
            handle_alloc_error(new_layout);
        }
        self.ptr = new_ptr;
        self.cap = new_cap;
        true
    }

    /// Frees the backing allocation. Elements must already be destroyed.
    pub(crate) fn release(&mut self, elem: Layout) {
        debug_assert_eq!(self.len, 0);
        if self.cap != 0 && self.cap != usize::MAX && elem.size() != 0 {
            unsafe {
                let layout =
                    Layout::from_size_align_unchecked(elem.size() * self.cap, elem.align());
                alloc::dealloc(self.ptr, layout);
            }
        }
        self.ptr = ptr::null_mut();
        self.cap = 0;
    }
}

impl Default for RawSeq {
    fn default() -> Self {
        Self::new()
    }
}

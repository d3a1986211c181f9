use std::sync::Arc;

use tether::{AcquireError, Comparison, HostReflect, Kind, TypeRegistry};

#[derive(Clone, Copy, Default, PartialEq)]
#[repr(C)]
struct Point {
    x: i64,
    y: i64,
}

struct PointType;

impl HostReflect for PointType {
    fn ident(&self) -> usize {
        0x1001
    }
    fn name(&self) -> &str {
        "Point"
    }
    fn size(&self) -> usize {
        size_of::<Point>()
    }
    fn align(&self) -> usize {
        align_of::<Point>()
    }
    unsafe fn init_default(&self, dst: *mut u8) {
        unsafe { dst.cast::<Point>().write(Point::default()) };
    }
    unsafe fn copy(&self, dst: *mut u8, src: *const u8) {
        unsafe { *dst.cast::<Point>() = *src.cast::<Point>() };
    }
    unsafe fn destroy(&self, _ptr: *mut u8) {}
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> Comparison {
        if unsafe { *a.cast::<Point>() == *b.cast::<Point>() } {
            Comparison::Equal
        } else {
            Comparison::NotEqual
        }
    }
    unsafe fn hash(&self, ptr: *const u8) -> Option<u64> {
        let p = unsafe { *ptr.cast::<Point>() };
        Some((p.x as u64).rotate_left(32) ^ p.y as u64)
    }
}

fn point_reflect() -> Arc<dyn HostReflect> {
    Arc::new(PointType)
}

#[test]
fn primitives_intern_to_one_descriptor() {
    let types = TypeRegistry::new();
    let a = types.acquire_primitive(Kind::Int32).unwrap();
    let b = types.acquire_primitive(Kind::Int32).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.size(), 4);
    assert_eq!(a.align(), 4);

    let s = types.acquire_primitive(Kind::Str).unwrap();
    assert_eq!(s.size(), size_of::<String>());
}

#[test]
fn acquire_primitive_rejects_other_bands() {
    let types = TypeRegistry::new();
    assert!(matches!(
        types.acquire_primitive(Kind::Array),
        Err(AcquireError::NotPrimitive(Kind::Array))
    ));
    assert!(matches!(
        types.acquire_primitive(Kind::StructType),
        Err(AcquireError::NotPrimitive(Kind::StructType))
    ));
}

#[test]
fn composites_intern_by_shape() {
    let types = TypeRegistry::new();
    let int32 = types.acquire_primitive(Kind::Int32).unwrap();
    let int64 = types.acquire_primitive(Kind::Int64).unwrap();

    let a = types
        .acquire_composite(Kind::Array, &[Arc::clone(&int32)])
        .unwrap();
    let b = types
        .acquire_composite(Kind::Array, &[Arc::clone(&int32)])
        .unwrap();
    let c = types
        .acquire_composite(Kind::Array, &[Arc::clone(&int64)])
        .unwrap();

    assert!(Arc::ptr_eq(&a, &b));
    assert!(!Arc::ptr_eq(&a, &c));
    assert_eq!(types.composite_count(), 2);
    assert_eq!(a.to_string(), "Array<Int32>");
}

#[test]
fn composite_arity_is_checked() {
    let types = TypeRegistry::new();
    let int32 = types.acquire_primitive(Kind::Int32).unwrap();
    let err = types
        .acquire_composite(Kind::Map, &[Arc::clone(&int32)])
        .unwrap_err();
    assert!(matches!(
        err,
        AcquireError::Arity {
            kind: Kind::Map,
            expected: 2,
            got: 1
        }
    ));
    assert!(matches!(
        types.acquire_composite(Kind::Int32, &[int32]),
        Err(AcquireError::NotComposite(Kind::Int32))
    ));
}

#[test]
fn enum_composite_requires_leaf_and_integral_base() {
    let types = TypeRegistry::new();
    let int32 = types.acquire_primitive(Kind::Int32).unwrap();
    let float = types.acquire_primitive(Kind::Float64).unwrap();

    let err = types
        .acquire_composite(Kind::Enum, &[Arc::clone(&int32), Arc::clone(&int32)])
        .unwrap_err();
    assert!(matches!(err, AcquireError::BadEnumBase(Kind::Int32)));

    struct ColorEnum;
    impl HostReflect for ColorEnum {
        fn ident(&self) -> usize {
            0x2001
        }
        fn name(&self) -> &str {
            "Color"
        }
        fn size(&self) -> usize {
            8
        }
        fn align(&self) -> usize {
            8
        }
        unsafe fn init_default(&self, dst: *mut u8) {
            unsafe { dst.cast::<i64>().write(0) };
        }
        unsafe fn copy(&self, dst: *mut u8, src: *const u8) {
            unsafe { *dst.cast::<i64>() = *src.cast::<i64>() };
        }
        unsafe fn destroy(&self, _ptr: *mut u8) {}
        unsafe fn compare(&self, a: *const u8, b: *const u8) -> Comparison {
            if unsafe { *a.cast::<i64>() == *b.cast::<i64>() } {
                Comparison::Equal
            } else {
                Comparison::NotEqual
            }
        }
        unsafe fn hash(&self, ptr: *const u8) -> Option<u64> {
            Some(unsafe { *ptr.cast::<i64>() } as u64)
        }
    }

    let host: Arc<dyn HostReflect> = Arc::new(ColorEnum);
    let leaf = types.acquire_leaf(Kind::EnumType, &host).unwrap();
    let err = types
        .acquire_composite(Kind::Enum, &[Arc::clone(&leaf), float])
        .unwrap_err();
    assert!(matches!(err, AcquireError::BadEnumBase(Kind::Float64)));

    let ok = types.acquire_composite(Kind::Enum, &[leaf, int32]).unwrap();
    assert_eq!(ok.size(), 4);
}

#[test]
fn leaves_intern_by_host_identity() {
    let types = TypeRegistry::new();
    let host = point_reflect();
    let a = types.acquire_leaf(Kind::StructType, &host).unwrap();
    let b = types.acquire_leaf(Kind::StructType, &host).unwrap();
    assert!(Arc::ptr_eq(&a, &b));
    assert_eq!(a.size(), size_of::<Point>());
    assert_eq!(a.leaf_ident(), Some(0x1001));
    assert_eq!(types.leaf_count(), 1);
}

#[test]
fn leaf_kind_conflict_is_an_error() {
    let types = TypeRegistry::new();
    let host = point_reflect();
    types.acquire_leaf(Kind::StructType, &host).unwrap();
    let err = types.acquire_leaf(Kind::ClassType, &host).unwrap_err();
    assert!(matches!(
        err,
        AcquireError::KindConflict {
            ident: 0x1001,
            existing: Kind::StructType,
            requested: Kind::ClassType
        }
    ));
}

#[test]
fn dead_leaf_goes_inert_and_rebinds() {
    let types = TypeRegistry::new();
    let host = point_reflect();
    let desc = types.acquire_leaf(Kind::StructType, &host).unwrap();
    assert!(!desc.is_dead_leaf());

    drop(host);
    assert!(desc.is_dead_leaf());
    assert_eq!(desc.size(), 0);

    let fresh_host = point_reflect();
    let fresh = types.acquire_leaf(Kind::StructType, &fresh_host).unwrap();
    assert!(!Arc::ptr_eq(&desc, &fresh));
    assert!(!fresh.is_dead_leaf());
}

#[test]
fn sweep_evicts_orphaned_cache_entries() {
    let types = TypeRegistry::new();
    let host = point_reflect();
    let leaf = types.acquire_leaf(Kind::StructType, &host).unwrap();
    let array = types
        .acquire_composite(Kind::Array, &[Arc::clone(&leaf)])
        .unwrap();
    let nested = types
        .acquire_composite(Kind::Array, &[Arc::clone(&array)])
        .unwrap();
    assert_eq!(types.composite_count(), 2);

    // Everything still referenced: sweep keeps the cache intact.
    types.sweep_after_host_collect();
    assert_eq!(types.composite_count(), 2);
    assert_eq!(types.leaf_count(), 1);

    // Dropping the outer references orphans the whole chain; eviction
    // cascades from the outermost composite inwards.
    drop(nested);
    drop(array);
    drop(host);
    types.sweep_after_host_collect();
    assert_eq!(types.composite_count(), 0);
    assert_eq!(types.leaf_count(), 0);
    drop(leaf);
}

#[test]
fn weakref_and_delegate_shapes() {
    let types = TypeRegistry::new();
    let int32 = types.acquire_primitive(Kind::Int32).unwrap();
    let err = types
        .acquire_composite(Kind::Delegate, &[Arc::clone(&int32)])
        .unwrap_err();
    assert!(matches!(err, AcquireError::BadSignature(Kind::Int32)));

    let weak = types.acquire_composite(Kind::WeakRef, &[int32]).unwrap();
    assert!(!weak.has_script_refs());
    assert!(!weak.has_host_refs());
}

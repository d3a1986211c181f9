//! Descriptor interning.
//!
//! One registry per runtime hands out `Arc<TypeDesc>` and guarantees that
//! the same shape always resolves to the same allocation, which is what lets
//! descriptor comparison be pointer comparison. Host-defined leaves are keyed
//! by the host's own type identity and held weakly through [`HostReflect`];
//! after a host collection the registry drops entries nobody can reach
//! anymore.

use std::sync::Arc;

use smallvec::SmallVec;

use super::descriptor::{HostReflect, Kind, TypeDesc};
use super::sync::SpinLock;
use super::{FastHashMap, fast_map_new};
use crate::errors::AcquireError;

/// Composite identity: the kind plus the identities of its sub-descriptors.
/// Interning makes `Arc::as_ptr` a stable identity for each sub.
type CompositeKey = (Kind, SmallVec<[usize; 2]>);

struct RegistryInner {
    primitives: FastHashMap<Kind, Arc<TypeDesc>>,
    composites: FastHashMap<CompositeKey, Arc<TypeDesc>>,
    leaves: FastHashMap<usize, Arc<TypeDesc>>,
}

pub struct TypeRegistry {
    inner: SpinLock<RegistryInner>,
}

impl TypeRegistry {
    pub fn new() -> Self {
        Self {
            inner: SpinLock::new(RegistryInner {
                primitives: fast_map_new(),
                composites: fast_map_new(),
                leaves: fast_map_new(),
            }),
        }
    }

    pub fn acquire_primitive(&self, kind: Kind) -> Result<Arc<TypeDesc>, AcquireError> {
        if !kind.is_primitive() {
            return Err(AcquireError::NotPrimitive(kind));
        }
        let mut inner = self.inner.lock();
        Ok(Arc::clone(
            inner
                .primitives
                .entry(kind)
                .or_insert_with(|| Arc::new(TypeDesc::primitive(kind))),
        ))
    }

    pub fn acquire_composite(
        &self,
        kind: Kind,
        subs: &[Arc<TypeDesc>],
    ) -> Result<Arc<TypeDesc>, AcquireError> {
        let expected = kind.arity().ok_or(AcquireError::NotComposite(kind))?;
        if subs.len() != expected {
            return Err(AcquireError::Arity {
                kind,
                expected,
                got: subs.len(),
            });
        }
        match kind {
            Kind::Enum => {
                if subs[0].kind() != Kind::EnumType {
                    return Err(AcquireError::BadEnumBase(subs[0].kind()));
                }
                if !is_integral(subs[1].kind()) {
                    return Err(AcquireError::BadEnumBase(subs[1].kind()));
                }
            }
            Kind::Delegate | Kind::MulticastDelegate => {
                if subs[0].kind() != Kind::FunctionType {
                    return Err(AcquireError::BadSignature(subs[0].kind()));
                }
            }
            _ => {}
        }

        let key: CompositeKey = (
            kind,
            subs.iter().map(|s| Arc::as_ptr(s) as usize).collect(),
        );
        let mut inner = self.inner.lock();
        Ok(Arc::clone(inner.composites.entry(key).or_insert_with(
            || Arc::new(TypeDesc::composite(kind, subs.iter().cloned().collect())),
        )))
    }

    /// Interns a host-defined leaf under the host type's identity. The
    /// reflection handle is held weakly; re-acquiring with a fresh host side
    /// after the old one died rebinds the entry to a new descriptor.
    pub fn acquire_leaf(
        &self,
        kind: Kind,
        reflect: &Arc<dyn HostReflect>,
    ) -> Result<Arc<TypeDesc>, AcquireError> {
        if !kind.is_user_defined() {
            return Err(AcquireError::NotUserDefined(kind));
        }
        let ident = reflect.ident();
        let mut inner = self.inner.lock();
        if let Some(existing) = inner.leaves.get(&ident) {
            if existing.kind() != kind {
                return Err(AcquireError::KindConflict {
                    ident,
                    existing: existing.kind(),
                    requested: kind,
                });
            }
            if !existing.is_dead_leaf() {
                return Ok(Arc::clone(existing));
            }
            log::debug!("rebinding dead host type {ident:#x} to a fresh descriptor");
        }
        let desc = Arc::new(TypeDesc::leaf(kind, ident, Arc::downgrade(reflect)));
        inner.leaves.insert(ident, Arc::clone(&desc));
        Ok(desc)
    }

    /// Drops cache entries the host collection made unreachable: leaves
    /// whose host side is gone, then any composite only the cache still
    /// holds. Eviction cascades, so the composite pass loops to a fixpoint.
    pub fn sweep_after_host_collect(&self) {
        let mut inner = self.inner.lock();
        let before = inner.leaves.len() + inner.composites.len();
        inner.leaves.retain(|_, desc| !desc.is_dead_leaf());
        loop {
            let len = inner.composites.len();
            inner
                .composites
                .retain(|_, desc| Arc::strong_count(desc) > 1);
            if inner.composites.len() == len {
                break;
            }
        }
        let evicted = before - (inner.leaves.len() + inner.composites.len());
        if evicted > 0 {
            log::trace!("descriptor sweep evicted {evicted} entries");
        }
    }

    pub fn composite_count(&self) -> usize {
        self.inner.lock().composites.len()
    }

    pub fn leaf_count(&self) -> usize {
        self.inner.lock().leaves.len()
    }
}

impl Default for TypeRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn is_integral(kind: Kind) -> bool {
    matches!(
        kind,
        Kind::Int8
            | Kind::Int16
            | Kind::Int32
            | Kind::Int64
            | Kind::Byte
            | Kind::UInt16
            | Kind::UInt32
            | Kind::UInt64
    )
}

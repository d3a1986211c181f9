pub mod descriptor;
pub mod handle;
pub mod registry;
pub mod sync;
pub mod value;

/// Hash map with a fast non-cryptographic hasher. Seeds are fixed so
/// iteration order is reproducible run to run.
pub(crate) type FastHashMap<K, V> = hashbrown::HashMap<K, V, ahash::RandomState>;

pub(crate) fn fast_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(0, 0, 0, 0)
}

pub(crate) fn fast_map_new<K, V>() -> FastHashMap<K, V> {
    FastHashMap::with_hasher(fast_hasher())
}

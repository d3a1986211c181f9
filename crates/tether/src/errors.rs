use thiserror::Error;

use crate::core::descriptor::Kind;

/// Failures while interning a type descriptor.
#[derive(Debug, Error)]
pub enum AcquireError {
    #[error("kind {0:?} is not a primitive")]
    NotPrimitive(Kind),
    #[error("kind {0:?} does not take sub-descriptors")]
    NotComposite(Kind),
    #[error("composite {kind:?} takes {expected} sub-descriptor(s), got {got}")]
    Arity {
        kind: Kind,
        expected: usize,
        got: usize,
    },
    #[error("kind {0:?} is not user-defined")]
    NotUserDefined(Kind),
    #[error("host type {ident:#x} is already registered as {existing:?}, not {requested:?}")]
    KindConflict {
        ident: usize,
        existing: Kind,
        requested: Kind,
    },
    #[error("enum composite requires an EnumType leaf and an integral base, got {0:?}")]
    BadEnumBase(Kind),
    #[error("delegate signature must be a FunctionType descriptor, got {0:?}")]
    BadSignature(Kind),
}

/// Failures while operating on boxed values.
#[derive(Debug, Error)]
pub enum ValueError {
    #[error("handle does not resolve to a live value box")]
    BadHandle,
    #[error("value box holds no data")]
    NoData,
    #[error("value data is stale (its owner was destroyed or rebuilt)")]
    StaleData,
    #[error("type mismatch: expected {expected}, got {got}")]
    TypeMismatch { expected: String, got: String },
    #[error("host side of type {0} has been dropped")]
    DeadType(String),
    #[error("offset {offset} + size {size} exceeds value size {len}")]
    OffsetOutOfRange {
        offset: usize,
        size: usize,
        len: usize,
    },
    #[error("value of type {0} has no elements")]
    NotAnArray(String),
    #[error("element index {index} out of range for length {len}")]
    IndexOutOfRange { index: usize, len: usize },
}

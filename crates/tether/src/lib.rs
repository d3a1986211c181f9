//! Safety and interop layer tethering an embedded scripting heap to a host
//! object system.
//!
//! The crate has four pieces:
//! - `core::handle` - generational slot registry and typed weak handles
//! - `core::descriptor` / `core::registry` - interned type descriptors with
//!   type-erased value operations
//! - `core::value` - boxed values with inline storage and version-checked
//!   aliasing
//! - `bridge` - the cross-collector mark/sweep protocol

#![allow(clippy::new_without_default)]
#![allow(clippy::too_many_arguments)]
#![allow(clippy::manual_range_contains)]
#![allow(clippy::len_zero)]

pub mod bridge;
pub mod config;
pub mod core;
pub mod errors;
pub mod runtime;

pub use crate::bridge::{CycleStats, EmbeddedTracer, GcBridge, GcPhase, Traceable};
pub use crate::config::RuntimeConfig;
pub use crate::core::descriptor::{
    Comparison, FormattedText, HostCollector, HostObjectPtr, HostReflect, Kind, RawSeq,
    ScriptDelegate, ScriptInterface, TypeDesc,
};
pub use crate::core::handle::{
    Handle, NativeCell, NativeItem, NativeProxy, RawHandle, SlotRegistry,
};
pub use crate::core::registry::TypeRegistry;
pub use crate::core::value::{MAX_INLINE_ALIGN, MAX_INLINE_SIZE, ValueBox};
pub use crate::errors::{AcquireError, ValueError};
pub use crate::runtime::ScriptRuntime;

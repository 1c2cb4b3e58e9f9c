//! Tanjun kubehub: where objects come from.
//!
//! [`KubeSource`] talks to an API server, [`MemorySource`] is the in-process
//! stand-in, and [`Reflector`] drives either one into the delta queue.

#![forbid(unsafe_code)]

pub mod backoff;
pub mod memory;
pub mod reflector;
pub mod source;
pub mod tanjunchen;

pub use backoff::{Backoff, BackoffConfig};
pub use memory::{MemorySource, Versioned};
pub use reflector::{ErrorHook, Health, Reflector, ReflectorConfig};
pub use source::KubeSource;
pub use tanjunchen::{Tanjunchen, TanjunchenSpec};

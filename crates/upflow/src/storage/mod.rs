//! Storage sinks shipped with the engine.
//!
//! The sink contract lives in [`crate::pipeline::StorageSink`]; this
//! module provides the in-memory implementation. Filesystem storage lives
//! in the `upflow-fs` crate.

mod memory;

pub use self::memory::MemorySink;

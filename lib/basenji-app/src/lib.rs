//! High-level application primitives.
//!
//! This crate provides the pieces needed to bootstrap a pipeline before it starts running: initializing logging, and
//! building the memory limiter and encoder allocator from configuration.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod logging;
pub mod memory;

/// Common imports.
pub mod prelude {
    pub use super::logging::{initialize_logging, LoggingConfiguration};
    pub use super::memory::{initialize_encoder_allocator, initialize_memory_limiter, MemoryLimiterConfiguration};
}

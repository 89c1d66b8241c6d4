//! Building blocks for bounding the memory used by a telemetry pipeline.
//!
//! ## Overview
//!
//! A pipeline that ingests batches of telemetry over RPC has two places where memory can grow without bound: the
//! requests it has read but not yet finished processing, and the buffers it builds when re-encoding those requests.
//! Oversized requests, too many requests blocked at once, or runaway encoder buffers can all crash the process.
//!
//! This crate provides three layers of protection:
//!
//! - an admission gate ([`AdmissionGate`]), bounding both the bytes in flight and the number of callers waiting for
//!   bytes to become available
//! - a memory limiter ([`MemoryLimiter`]), which specializes the gate for inbound requests: bounded waits, an explicit
//!   lifecycle, and telemetry on refusals
//! - a bounded allocator ([`BoundedAllocator`]), which puts a hard ceiling on the buffers allocated while encoding
//!
//! ## Logical budgets
//!
//! None of these track actual process memory. They track logical byte budgets supplied by callers: a request is
//! admitted for the size it reports, and an encoder buffer is accounted for by its length. It is up to callers to
//! choose sizes that reflect the memory a request will actually consume.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod allocator;
pub use self::allocator::{BoundedAllocator, BufferAllocator, HeapAllocator, LimitError};

mod gate;
pub use self::gate::{AcquireContext, AdmissionError, AdmissionGate, AdmissionPermit};

mod limiter;
pub use self::limiter::{LimiterConfig, LimiterConfigError, MemoryLimiter, RequestSizeFn};

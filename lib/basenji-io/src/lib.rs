//! Network-facing building blocks: admission control for inbound RPCs, and per-method byte accounting.
#![deny(warnings)]
#![deny(missing_docs)]

pub mod net;

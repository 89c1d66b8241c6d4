//! RPC plumbing.

pub mod admission;
pub mod stats;
pub mod util;

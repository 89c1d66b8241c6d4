//! Encoder implementations.

pub mod columnar;

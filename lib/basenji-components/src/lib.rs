//! Component implementations.
//!
//! This crate contains the pipeline components that draw on the shared memory budgets.

#![deny(warnings)]
#![deny(missing_docs)]

pub mod encoders;

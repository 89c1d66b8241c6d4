//! Helpers for working with RPC types.

mod status;
pub use self::status::StatusError;

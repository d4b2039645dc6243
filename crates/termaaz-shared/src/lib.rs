//! Shared domain types, wire protocol, and constants for the termaaz core.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod time;
pub mod types;

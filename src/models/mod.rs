//! Core data types flowing through the relay.
//!
//! These are plain values: the services produce and consume them, and the
//! run report serializes naturally as JSON via `serde`.

pub mod file_record;
pub mod processing_state;
pub mod receipt;
pub mod report;

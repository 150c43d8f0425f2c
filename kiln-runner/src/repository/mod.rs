//! Repository layer
//!
//! Repositories abstract communication with the control plane behind a
//! trait so the scheduler and pipeline can be exercised against an
//! in-memory fake.

mod builds;
#[cfg(test)]
pub mod memory;

pub use builds::{BuildRepository, HttpBuildRepository};

//! Core domain types
//!
//! This module contains the core domain structures used across Kiln crates.
//! These types represent the records the control plane owns (jobs, builds,
//! tasks) and the execution logs the executor produces while running them.

pub mod build;
pub mod job;
pub mod log;
pub mod task;

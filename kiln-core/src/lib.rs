//! Kiln Core
//!
//! Core types and abstractions for the Kiln build executor.
//!
//! This crate contains:
//! - Domain types: Core business entities (Job, Build, Task, execution logs)
//! - DTOs: Data transfer objects for executor/control-plane communication

pub mod domain;
pub mod dto;

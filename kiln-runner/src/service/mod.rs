//! Service layer
//!
//! Services hold in-process state shared between a build's tasks.

mod log_buffer;

pub use log_buffer::{EntryId, InMemoryLogBuffer, LogBufferService};

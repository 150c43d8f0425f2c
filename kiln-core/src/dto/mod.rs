//! Data Transfer Objects for executor/control-plane communication
//!
//! DTOs are the request and response bodies of the control-plane API.
//! Every optional field is skipped when absent so that partial updates only
//! touch the fields they name.

pub mod build;
pub mod log;
pub mod task;

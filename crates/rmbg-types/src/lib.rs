//! Core types and traits for the rmbg background-removal job service.
//!
//! The data model (JobRecord, JobDescriptor), the HTTP/callback DTOs, and the
//! JobStore / JobQueue seams shared by the API and the workers.

mod dto;
mod job;
mod traits;

pub use dto::*;
pub use job::*;
pub use traits::*;

//! Best-effort callback delivery for job status transitions.

mod client;

pub use client::{CallbackClient, CallbackConfig, DeliveryError};
pub use rmbg_types::{CallbackNotice, CallbackSpec};

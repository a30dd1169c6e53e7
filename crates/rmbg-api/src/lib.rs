//! rmbg HTTP API and process roles.

pub mod app;
pub mod config;
pub mod error;
pub mod server;
pub mod shutdown;

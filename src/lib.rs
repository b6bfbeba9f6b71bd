#![forbid(unsafe_code)]

//! `datagate` — a read-only data-access server speaking JSON-RPC over a
//! local stdio channel and a streamable HTTP channel.

pub mod config;
pub mod engine;
pub mod errors;
pub mod mcp;
pub mod models;
pub mod session;
pub mod stats;

pub use config::GlobalConfig;
pub use errors::{AppError, Result};

//! Protocol layer: JSON-RPC routing, tools, and both transports.

pub mod codec;
pub mod context;
pub mod handler;
pub mod origin;
pub mod sse;
pub mod tools;
pub mod transport;
pub mod version;

//! Session registry, per-session event logs, and idle reaping.

pub mod event_log;
pub mod reaper;
pub mod registry;

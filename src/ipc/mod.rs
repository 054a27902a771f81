//! Inter-process communication between the CLI and the relay host.

pub mod client;
pub mod messages;

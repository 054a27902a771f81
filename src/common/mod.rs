//! Types and utilities shared between the CLI, the supervisor and the relay host.

pub mod command;
pub mod config;
pub mod error;
pub mod logging;

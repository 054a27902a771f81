//! Relay host: decision engine, notification plumbing and lifecycle.

pub mod backoff;
pub mod filter;
pub mod notifier;
pub mod probe;
pub mod relay;
pub mod server;
pub mod slot;
pub mod supervisor;

#[cfg(test)]
pub mod testing;

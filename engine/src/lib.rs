//! Admission and credential routing.
//!
//! [`Engine`] ties the credential pool, egress pool, admission control and the
//! background probe loops together behind the operations a relay front end
//! needs: admit a user and pick a credential, pick an egress path, feed the
//! upstream outcome back, and inspect or probe the pools.

pub mod config;
pub mod config_source;
mod engine;
pub mod errors;
pub mod metrics_defs;
pub mod refresh;
pub mod scheduler;
#[cfg(test)]
mod testutils;

pub use config::{SchedulerPolicy, Settings, SharedSettings};
pub use engine::{Engine, EngineBuilder};
pub use errors::RelayError;

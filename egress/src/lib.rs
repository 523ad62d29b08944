//! Outbound path selection for provider calls.
//!
//! An [`EgressPool`] holds the configured egress proxies with independent
//! cooldown state. Users are mapped onto available paths by a deterministic
//! hash so the provider keeps seeing the same calling address for a user while
//! that path stays healthy.

pub mod config;
pub mod keepalive;
pub mod mask;
pub mod metrics_defs;
pub mod pool;

pub use config::{EgressPolicy, ProxyMode, ProxyStrategy};
pub use keepalive::{HttpPathProber, Keepalive, PathProber};
pub use mask::mask_proxy_url;
pub use pool::{EgressPool, PathSnapshot};

pub mod backoff;
pub mod clock;
pub mod http;
pub mod metrics_defs;

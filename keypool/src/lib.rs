//! Shared pool of provider credentials: health state, failure classification,
//! least-recently-used selection and per-user admission.

pub mod admission;
pub mod classifier;
pub mod config;
pub mod credential;
pub mod health;
pub mod metrics_defs;
pub mod selector;
pub mod store;

pub use credential::{Credential, CredentialId, CredentialStatus, Secret, UserId};

use keypool::admission::AdmissionError;
use keypool::store::StoreError;

#[derive(thiserror::Error, Debug)]
pub enum RelayError {
    #[error("quota exhausted")]
    QuotaExhausted,
    #[error("rate limited ({used}/{quota} per minute)")]
    RateLimited { used: usize, quota: i64 },
    #[error("no credential available")]
    NoCredentialAvailable,
    #[error("credential store error: {0}")]
    Store(#[from] StoreError),
}

impl RelayError {
    /// Capacity conditions are expected under load and are not engine faults.
    pub fn is_capacity(&self) -> bool {
        !matches!(self, RelayError::Store(_))
    }
}

impl From<AdmissionError> for RelayError {
    fn from(error: AdmissionError) -> Self {
        match error {
            AdmissionError::NoQuota => RelayError::QuotaExhausted,
            AdmissionError::RateLimited { used, quota } => RelayError::RateLimited { used, quota },
            AdmissionError::Store(e) => RelayError::Store(e),
        }
    }
}

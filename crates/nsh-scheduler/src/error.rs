use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("submitting job")]
    Submission(String),
    #[error("authentication failure")]
    AuthenticationFailure,
    #[error("querying job state")]
    Query(String),
    #[error("cancelling job")]
    Cancel(String),
    #[error("backend is not compiled in (missing feature)")]
    BackendUnavailable(&'static str),
    #[error("native backend call failed: {0}")]
    Native(String),
    #[error("cancelled")]
    Cancelled,
}

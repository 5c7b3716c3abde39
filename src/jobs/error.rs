use super::validation::ValidationError;
use thiserror::Error;

/// Errors returned synchronously by [`crate::jobs::Manager::submit_job`]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SubmitError {
    /// The definition was recorded as a Failed job under `job_id`
    #[error("job {job_id} rejected: {source}")]
    Invalid {
        job_id: String,
        #[source]
        source: ValidationError,
    },

    /// Nothing was recorded
    #[error("job with ID {0} already exists")]
    DuplicateId(String),

    /// Nothing was recorded
    #[error("{0}")]
    InvalidId(ValidationError),

    #[error("manager is shutting down")]
    ShuttingDown,
}

impl SubmitError {
    /// Id of the recorded job, when the submission left one behind
    pub fn job_id(&self) -> Option<&str> {
        match self {
            SubmitError::Invalid { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum JobError {
    #[error("job not found: {0}")]
    NotFound(String),
}

/// Reason a single id could not be cancelled
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CancelError {
    #[error("job not found: {0}")]
    NotFound(String),

    #[error("job {id} cannot be cancelled (status: {status})")]
    Terminal { id: String, status: super::JobStatus },

    #[error("cancellation already requested for job {0}")]
    AlreadyRequested(String),
}

//! Job registry, lifecycle and execution

mod error;
mod manager;
mod models;
pub mod progress;
pub mod validation;

pub use error::{CancelError, JobError, SubmitError};
pub use manager::Manager;
pub use models::{
    BatchSubmitResponse, CancelResponse, DaemonStatus, Job, JobDefinition, JobKind, JobProgress,
    JobQuery, JobResult, JobStatus, QueryResponse,
};
pub use progress::{ByteRateEta, EtaEstimate};
pub use validation::ValidationError;

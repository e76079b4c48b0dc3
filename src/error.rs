use std::path::PathBuf;

/// All errors that can occur in the orchestrator.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("project not found: {0}")]
    ProjectNotFound(String),

    #[error("submission id already in use for another project: {0}")]
    RequestIdBusy(String),

    #[error("project already has a submission in flight: {0}")]
    ProjectBusy(String),

    #[error(
        "per-test deadline / test-name / test-file filters are only supported for projects with a task-local runner"
    )]
    FiltersUnsupported,

    #[error("malformed request body: {0}")]
    InvalidRequest(String),

    #[error("failed to spawn subprocess: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("subprocess failed with exit code {code}: {message}")]
    ProcessFailed { code: i32, message: String },

    #[error("failed to parse runner output: {0}")]
    ParseError(String),

    #[error("phase timed out after {0} seconds")]
    Timeout(u64),

    #[error("working directory does not exist: {0}")]
    InvalidWorkDir(PathBuf),

    #[error("submission not found: {0}")]
    SubmissionNotFound(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Stable error code string for programmatic consumption.
    pub fn code(&self) -> &'static str {
        match self {
            Error::ProjectNotFound(_) => "E001",
            Error::RequestIdBusy(_) => "E002",
            Error::ProjectBusy(_) => "E003",
            Error::FiltersUnsupported => "E004",
            Error::InvalidRequest(_) => "E005",
            Error::SpawnFailed(_) => "E006",
            Error::ProcessFailed { .. } => "E007",
            Error::ParseError(_) => "E008",
            Error::Timeout(_) => "E009",
            Error::InvalidWorkDir(_) => "E010",
            Error::SubmissionNotFound(_) => "E011",
            Error::Io(_) => "E012",
            Error::Json(_) => "E013",
            Error::Other(_) => "E999",
        }
    }

    /// Whether this error represents an admission conflict rather than a
    /// pipeline failure (see SPEC_FULL.md §7, "Admission conflict").
    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::RequestIdBusy(_) | Error::ProjectBusy(_))
    }
}

pub type Result<T> = std::result::Result<T, Error>;

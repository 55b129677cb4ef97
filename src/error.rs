#[derive(Debug, thiserror::Error)]
/// Failure modes of running an external tool such as '7z' or 'yt-dlp'.
pub(crate) enum ProcessError {
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{message}")]
    Exited {
        program: String,
        code: Option<i32>,
        message: String,
    },

    #[error("Process '{program}' did not exit within {secs} seconds and was killed")]
    TimedOut { program: String, secs: u64 },
}

impl ProcessError {
    // Exit code of the process, if it ran to completion with one.
    pub(crate) fn exit_code(&self) -> Option<i32> {
        match self {
            ProcessError::Exited { code, .. } => *code,
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
/// `JobError` is the error type every action handler fails with. The queue
/// decides based on the variant whether a failed job gets another attempt.
pub(crate) enum JobError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    Validation(String),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error("Acquisition failed: {0}")]
    Acquisition(String),

    #[error("Filesystem operation failed: {0}")]
    Io(#[from] std::io::Error),
}

impl JobError {
    /// Only failures of external tools, the network or the filesystem are worth
    /// a second try, everything else would fail the same way again.
    pub(crate) fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Process(_) | JobError::Acquisition(_) | JobError::Io(_)
        )
    }

    pub(crate) fn kind(&self) -> &'static str {
        match self {
            JobError::NotFound(_) => "not_found",
            JobError::Conflict(_) => "conflict",
            JobError::Validation(_) => "validation",
            JobError::Process(_) => "process",
            JobError::Acquisition(_) => "acquisition",
            JobError::Io(_) => "io",
        }
    }

    pub(crate) fn status_code(&self) -> axum::http::StatusCode {
        match self {
            JobError::NotFound(_) => axum::http::StatusCode::NOT_FOUND,
            JobError::Conflict(_) => axum::http::StatusCode::CONFLICT,
            JobError::Validation(_) => axum::http::StatusCode::BAD_REQUEST,
            JobError::Process(_) | JobError::Acquisition(_) | JobError::Io(_) => {
                axum::http::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("Queue '{0}' is no longer accepting jobs")]
pub(crate) struct QueueClosed(pub(crate) &'static str);

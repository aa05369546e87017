use thiserror::Error;

/// RPC-style status attached to errors that cross a process boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportStatus {
    Cancelled,
    Unknown,
    InvalidArgument,
    DeadlineExceeded,
    Aborted,
    Internal,
    Unavailable,
}

impl TransportStatus {
    /// Numeric code, aligned with the gRPC status table.
    pub fn code(self) -> u16 {
        match self {
            TransportStatus::Cancelled => 1,
            TransportStatus::Unknown => 2,
            TransportStatus::InvalidArgument => 3,
            TransportStatus::DeadlineExceeded => 4,
            TransportStatus::Aborted => 10,
            TransportStatus::Internal => 13,
            TransportStatus::Unavailable => 14,
        }
    }
}

impl std::fmt::Display for TransportStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TransportStatus::Cancelled => "CANCELLED",
            TransportStatus::Unknown => "UNKNOWN",
            TransportStatus::InvalidArgument => "INVALID_ARGUMENT",
            TransportStatus::DeadlineExceeded => "DEADLINE_EXCEEDED",
            TransportStatus::Aborted => "ABORTED",
            TransportStatus::Internal => "INTERNAL",
            TransportStatus::Unavailable => "UNAVAILABLE",
        };
        f.write_str(name)
    }
}

/// Errors produced by steps, the runner, and the remote-call adapters.
#[derive(Error, Debug)]
pub enum PipelineError {
    /// A configuration value was rejected at set-time.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// A step received a null item.
    #[error("Step '{step}' received a null input")]
    NullInput { step: String },

    /// A many-to-one step was fed a stream that produced no items.
    #[error("Step '{step}' requires at least one input item")]
    EmptyInputNotAllowed { step: String },

    /// A bug signal. Never retried.
    #[error("Programmer error: {0}")]
    ProgrammerError(String),

    /// Network, timeout or throttling failure. Retried with backoff.
    #[error("Transient failure: {0}")]
    TransientFailure(String),

    /// Retries were exhausted and the step does not recover.
    #[error("Step '{step}' failed after {attempts} attempt(s): {source}")]
    PermanentFailure {
        step: String,
        attempts: u32,
        #[source]
        source: Box<PipelineError>,
    },

    /// Failure translated for propagation across a process boundary.
    #[error("{status} ({code}): {description}", code = .status.code())]
    Transport {
        status: TransportStatus,
        description: String,
        #[source]
        source: Box<PipelineError>,
    },

    /// The pipeline could not be assembled.
    #[error("Pipeline assembly failed: {0}")]
    Assembly(String),

    /// The run was cancelled via the cancellation flag.
    #[error("Pipeline was cancelled")]
    Cancelled,

    /// The run passed its deadline.
    #[error("Pipeline deadline exceeded")]
    DeadlineExceeded,

    /// JSON (de)serialization failed at the serde level.
    #[error("JSON conversion failed: {0}")]
    Json(#[from] serde_json::Error),

    /// Low-level HTTP failure (health probes).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Whether the step execution contract may retry this failure.
    pub fn is_retryable(&self) -> bool {
        match self {
            PipelineError::InvalidConfiguration(_)
            | PipelineError::NullInput { .. }
            | PipelineError::EmptyInputNotAllowed { .. }
            | PipelineError::ProgrammerError(_)
            | PipelineError::Assembly(_)
            | PipelineError::Cancelled
            | PipelineError::DeadlineExceeded
            | PipelineError::Json(_) => false,
            PipelineError::Transport { source, .. } => source.is_retryable(),
            PipelineError::PermanentFailure { .. } => false,
            PipelineError::TransientFailure(_)
            | PipelineError::Request(_)
            | PipelineError::Other(_) => true,
        }
    }

    /// The status this failure maps onto when it crosses a process boundary.
    pub fn transport_status(&self) -> TransportStatus {
        match self {
            PipelineError::InvalidConfiguration(_)
            | PipelineError::NullInput { .. }
            | PipelineError::EmptyInputNotAllowed { .. }
            | PipelineError::Json(_) => TransportStatus::InvalidArgument,
            PipelineError::ProgrammerError(_) | PipelineError::Assembly(_) => {
                TransportStatus::Internal
            }
            PipelineError::TransientFailure(_) | PipelineError::Request(_) => {
                TransportStatus::Unavailable
            }
            PipelineError::PermanentFailure { .. } => TransportStatus::Aborted,
            PipelineError::Transport { status, .. } => *status,
            PipelineError::Cancelled => TransportStatus::Cancelled,
            PipelineError::DeadlineExceeded => TransportStatus::DeadlineExceeded,
            PipelineError::Other(_) => TransportStatus::Unknown,
        }
    }

    /// Wrap into a [`PipelineError::Transport`], keeping the original cause.
    ///
    /// Already-translated errors are returned unchanged.
    pub fn into_transport(self) -> PipelineError {
        if matches!(self, PipelineError::Transport { .. }) {
            return self;
        }
        PipelineError::Transport {
            status: self.transport_status(),
            description: self.to_string(),
            source: Box::new(self),
        }
    }

    /// Innermost cause, looking through permanent-failure and transport wrappers.
    pub fn root_cause(&self) -> &PipelineError {
        match self {
            PipelineError::PermanentFailure { source, .. }
            | PipelineError::Transport { source, .. } => source.root_cause(),
            other => other,
        }
    }
}

impl From<anyhow::Error> for PipelineError {
    fn from(err: anyhow::Error) -> Self {
        PipelineError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::descriptor::StreamDescriptor;
use crate::error::{EngineError, ErrorKind};

/// Lifecycle of a [`DownloadJob`].
///
/// `Paused` is reachable only through cancellation. `Completed` and `Failed`
/// are terminal for a run; a failed or paused job may be retried by a new run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    #[default]
    Pending,
    InProgress,
    Paused,
    Completed,
    Failed,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Paused => "paused",
            Self::Completed => "completed",
            Self::Failed => "failed",
        })
    }
}

/// Status of one fragment within a fragmented job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FragmentStatus {
    #[default]
    Pending,
    Fetching,
    /// Bytes are in the staging file at the position implied by the fragment order.
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FragmentState {
    pub index: usize,
    pub status: FragmentStatus,
    pub retry_count: u32,
    /// Body size once done.
    pub byte_count: Option<u64>,
}

impl FragmentState {
    pub fn pending(index: usize) -> Self {
        Self {
            index,
            status: FragmentStatus::Pending,
            retry_count: 0,
            byte_count: None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status == FragmentStatus::Done
    }
}

/// Last error recorded on a job, kept as kind + message so it can be cloned
/// into reports.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobError {
    pub kind: ErrorKind,
    pub message: String,
    /// Fragment index for fragment failures.
    pub fragment_index: Option<usize>,
}

impl From<&EngineError> for JobError {
    fn from(err: &EngineError) -> Self {
        let fragment_index = match err {
            EngineError::FragmentUnrecoverable { index, .. } => Some(*index),
            _ => None,
        };
        Self {
            kind: err.kind(),
            message: err.to_string(),
            fragment_index,
        }
    }
}

/// The unit of work for one stream.
#[derive(Debug, Clone)]
pub struct DownloadJob {
    pub job_id: String,
    pub descriptor: Arc<StreamDescriptor>,
    pub staging_path: PathBuf,
    /// Bytes durably present in the staging file.
    pub bytes_written: u64,
    pub total_bytes: Option<u64>,
    pub state: JobState,
    /// Retries spent during the current run.
    pub retry_count: u32,
    pub last_error: Option<JobError>,
}

impl DownloadJob {
    pub fn new(
        job_id: impl Into<String>,
        descriptor: Arc<StreamDescriptor>,
        staging_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            job_id: job_id.into(),
            total_bytes: descriptor.filesize,
            descriptor,
            staging_path: staging_path.into(),
            bytes_written: 0,
            state: JobState::Pending,
            retry_count: 0,
            last_error: None,
        }
    }

    /// Sidecar path holding resume state next to the staging file.
    pub fn sidecar_path(&self) -> PathBuf {
        crate::staging::sidecar_path_for(&self.staging_path)
    }

    pub(crate) fn start(&mut self) {
        self.state = JobState::InProgress;
        self.retry_count = 0;
        self.last_error = None;
    }

    pub(crate) fn complete(&mut self) -> JobState {
        self.state = JobState::Completed;
        self.state
    }

    pub(crate) fn pause(&mut self) -> JobState {
        self.state = JobState::Paused;
        self.state
    }

    pub(crate) fn fail(&mut self, err: &EngineError) -> JobState {
        self.last_error = Some(JobError::from(err));
        self.state = JobState::Failed;
        self.state
    }
}

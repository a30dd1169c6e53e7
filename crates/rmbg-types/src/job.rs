//! Job lifecycle types: JobRecord (status store), JobDescriptor (queue message), timings.

use crate::StoreError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use uuid::Uuid;

/// Status of a job. Transitions: pending -> processing -> completed | failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Whether `self -> next` is an edge of the lifecycle state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Pending, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!("unknown job status: {}", other)),
        }
    }
}

/// Caller-supplied callback target carried on the descriptor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CallbackSpec {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    /// Opaque caller metadata echoed back in every callback body.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_data: Option<serde_json::Map<String, serde_json::Value>>,
}

/// Queue message for one job. Carries a reference to the persisted input, never the payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobDescriptor {
    pub task_id: String,
    pub input_path: PathBuf,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub callback: Option<CallbackSpec>,
    pub submitted_at: DateTime<Utc>,
}

impl JobDescriptor {
    /// New descriptor with a fresh task id, stamped with the current time.
    pub fn new(
        input_path: impl Into<PathBuf>,
        original_filename: Option<String>,
        callback: Option<CallbackSpec>,
    ) -> Self {
        Self {
            task_id: Uuid::new_v4().to_string(),
            input_path: input_path.into(),
            original_filename,
            callback,
            submitted_at: Utc::now(),
        }
    }
}

/// Timings persisted with a terminal record, in seconds rounded to milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct JobTimings {
    pub queue_time: f64,
    pub processing_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_time: Option<f64>,
}

impl JobTimings {
    /// queue_time = started - queued (clamped at zero), processing_time = finished - started.
    pub fn measure(
        queued_at: DateTime<Utc>,
        started_at: DateTime<Utc>,
        finished_at: DateTime<Utc>,
        model_time: Option<Duration>,
    ) -> Self {
        Self {
            queue_time: seconds_between(queued_at, started_at).max(0.0),
            processing_time: seconds_between(started_at, finished_at).max(0.0),
            model_time: model_time.map(|d| round_secs(d.as_secs_f64())),
        }
    }
}

/// Signed difference `to - from` in seconds, rounded to milliseconds.
pub fn seconds_between(from: DateTime<Utc>, to: DateTime<Utc>) -> f64 {
    let micros = (to - from).num_microseconds().unwrap_or(i64::MAX);
    round_secs(micros as f64 / 1_000_000.0)
}

pub fn round_secs(secs: f64) -> f64 {
    (secs * 1000.0).round() / 1000.0
}

/// Result of one execution attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "lowercase")]
pub enum JobOutcome {
    Success {
        result_url: String,
        output_filename: String,
    },
    Failure {
        reason: String,
    },
}

impl JobOutcome {
    pub fn status(&self) -> JobStatus {
        match self {
            JobOutcome::Success { .. } => JobStatus::Completed,
            JobOutcome::Failure { .. } => JobStatus::Failed,
        }
    }
}

/// Terminal write: outcome plus the timings computed at completion.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    pub outcome: JobOutcome,
    pub completed_at: DateTime<Utc>,
    pub timings: JobTimings,
}

/// Current state of a job as seen by status queries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    pub task_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    /// Submission timestamp taken from the descriptor; base for queue_time.
    pub queued_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timings: Option<JobTimings>,
}

impl JobRecord {
    /// Pending record for a descriptor about to be enqueued.
    pub fn pending(descriptor: &JobDescriptor) -> Self {
        Self {
            task_id: descriptor.task_id.clone(),
            status: JobStatus::Pending,
            created_at: Utc::now(),
            queued_at: descriptor.submitted_at,
            started_at: None,
            completed_at: None,
            original_filename: descriptor.original_filename.clone(),
            result_url: None,
            output_filename: None,
            error: None,
            timings: None,
        }
    }

    fn check_transition(&self, next: JobStatus) -> Result<(), StoreError> {
        if self.status.can_transition_to(next) {
            Ok(())
        } else {
            Err(StoreError::InvalidTransition {
                task_id: self.task_id.clone(),
                from: self.status,
                to: next,
            })
        }
    }

    /// pending -> processing.
    pub fn apply_processing(&mut self, started_at: DateTime<Utc>) -> Result<(), StoreError> {
        self.check_transition(JobStatus::Processing)?;
        self.status = JobStatus::Processing;
        self.started_at = Some(started_at);
        Ok(())
    }

    /// processing -> completed | failed. The record is immutable afterwards.
    pub fn apply_completion(&mut self, completion: Completion) -> Result<(), StoreError> {
        self.check_transition(completion.outcome.status())?;
        self.status = completion.outcome.status();
        self.completed_at = Some(completion.completed_at);
        self.timings = Some(completion.timings);
        match completion.outcome {
            JobOutcome::Success {
                result_url,
                output_filename,
            } => {
                self.result_url = Some(result_url);
                self.output_filename = Some(output_filename);
            }
            JobOutcome::Failure { reason } => {
                self.error = Some(reason);
            }
        }
        Ok(())
    }
}

/// Compute device a worker is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "kind", content = "index")]
pub enum Device {
    Cpu,
    Gpu(u32),
}

impl Device {
    pub fn index(self) -> Option<u32> {
        match self {
            Device::Cpu => None,
            Device::Gpu(i) => Some(i),
        }
    }
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Cpu => f.write_str("cpu"),
            Device::Gpu(i) => write!(f, "cuda:{}", i),
        }
    }
}

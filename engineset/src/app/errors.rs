// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;

use thiserror::Error as ThisError;

pub mod codes {
    pub const CONTROLLER_NOT_READY: &str = "controller_not_ready";
    pub const MISSING_INPUT_FILE: &str = "missing_input_file";
    pub const INVALID_REQUIREMENT_SYNTAX: &str = "invalid_requirement_syntax";
    pub const INVALID_ARGUMENT: &str = "invalid_argument";
    pub const CONFLICT: &str = "conflict";
    pub const STOPPED: &str = "stopped";
    pub const SUBMISSION_ERROR: &str = "submission_error";
    pub const POLL_QUERY_ERROR: &str = "poll_query_error";
    pub const JOB_TIMED_OUT: &str = "job_timed_out";
    pub const TUNNEL_START_FAILED: &str = "tunnel_start_failed";
    pub const TUNNEL_DIED: &str = "tunnel_died";
    pub const GRACEFUL_STOP_TIMEOUT: &str = "graceful_stop_timeout";
    pub const LOCAL_ERROR: &str = "local_error";
}

/// Everything that can go wrong while launching or supervising an engine set.
///
/// Errors raised before submission are returned from `start`; the rest only
/// ever reach the caller through a stop report.
#[derive(Debug, Clone, PartialEq, Eq, ThisError)]
pub enum LaunchError {
    #[error("controller is not ready: {location} (waited {waited_secs}s)")]
    ControllerNotReady { location: String, waited_secs: u64 },

    #[error("input file does not exist: {}", path.display())]
    MissingInputFile { path: PathBuf },

    #[error("classad syntax error in `{field}`: {value}")]
    InvalidRequirementSyntax { field: &'static str, value: String },

    #[error("engine count must be positive")]
    InvalidEngineCount,

    #[error("engine launcher has already been started")]
    AlreadyStarted,

    #[error("engine launcher was stopped while it was starting")]
    Stopped,

    #[error("job submission failed: {0}")]
    Submission(String),

    #[error("job query failed: {0}")]
    PollQuery(String),

    #[error("condor job {job_id} did not start within {elapsed_secs}s (JobStatus={status})")]
    JobTimedOut {
        job_id: String,
        status: i32,
        elapsed_secs: u64,
    },

    #[error("ssh tunnel is already {0}")]
    TunnelBusy(&'static str),

    #[error("port-forward descriptor: {0}")]
    PortForward(String),

    #[error("ssh tunnel failed to start: {0}")]
    TunnelStartFailed(String),

    #[error("ssh tunnel for job {job_id} exited while the job was running: {detail}")]
    TunnelDied { job_id: String, detail: String },

    #[error("ssh tunnel (pid {pid}) did not exit after SIGTERM; kill it manually")]
    GracefulStopTimeout { pid: u32 },

    #[error("{0}")]
    Io(String),
}

impl LaunchError {
    pub fn code(&self) -> &'static str {
        match self {
            LaunchError::ControllerNotReady { .. } => codes::CONTROLLER_NOT_READY,
            LaunchError::MissingInputFile { .. } => codes::MISSING_INPUT_FILE,
            LaunchError::InvalidRequirementSyntax { .. } => codes::INVALID_REQUIREMENT_SYNTAX,
            LaunchError::InvalidEngineCount => codes::INVALID_ARGUMENT,
            LaunchError::AlreadyStarted | LaunchError::TunnelBusy(_) => codes::CONFLICT,
            LaunchError::Stopped => codes::STOPPED,
            LaunchError::Submission(_) => codes::SUBMISSION_ERROR,
            LaunchError::PollQuery(_) => codes::POLL_QUERY_ERROR,
            LaunchError::JobTimedOut { .. } => codes::JOB_TIMED_OUT,
            LaunchError::PortForward(_) | LaunchError::TunnelStartFailed(_) => {
                codes::TUNNEL_START_FAILED
            }
            LaunchError::TunnelDied { .. } => codes::TUNNEL_DIED,
            LaunchError::GracefulStopTimeout { .. } => codes::GRACEFUL_STOP_TIMEOUT,
            LaunchError::Io(_) => codes::LOCAL_ERROR,
        }
    }

    /// True for failures that are detected before anything was submitted.
    pub fn is_pre_submission(&self) -> bool {
        matches!(
            self,
            LaunchError::ControllerNotReady { .. }
                | LaunchError::MissingInputFile { .. }
                | LaunchError::InvalidRequirementSyntax { .. }
                | LaunchError::InvalidEngineCount
                | LaunchError::AlreadyStarted
                | LaunchError::Submission(_)
        )
    }
}

pub fn local_error(message: impl Into<String>) -> LaunchError {
    LaunchError::Io(message.into())
}

pub type LaunchResult<T> = Result<T, LaunchError>;

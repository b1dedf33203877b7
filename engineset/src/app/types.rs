// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use time::OffsetDateTime;

use crate::app::errors::{LaunchError, LaunchResult};

/// Scheduler-assigned job identifier (the HTCondor cluster id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobId(String);

impl JobId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One submitted batch job. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
    pub job_id: JobId,
    pub submitted_at: OffsetDateTime,
    pub engines: u32,
}

/// HTCondor `JobStatus` values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    /// Status could not be read (or the scheduler returned 0).
    Unknown,
    Idle,
    Running,
    Removed,
    Completed,
    Held,
    TransferringOutput,
    Suspended,
    /// The job left the queue and no history record was found for it.
    Gone,
}

impl JobState {
    pub fn from_code(code: i32) -> Self {
        match code {
            1 => JobState::Idle,
            2 => JobState::Running,
            3 => JobState::Removed,
            4 => JobState::Completed,
            5 => JobState::Held,
            6 => JobState::TransferringOutput,
            7 => JobState::Suspended,
            _ => JobState::Unknown,
        }
    }

    pub fn code(self) -> i32 {
        match self {
            JobState::Unknown => 0,
            JobState::Idle => 1,
            JobState::Running => 2,
            JobState::Removed => 3,
            JobState::Completed => 4,
            JobState::Held => 5,
            JobState::TransferringOutput => 6,
            JobState::Suspended => 7,
            JobState::Gone => -1,
        }
    }

    /// Parses the raw `condor_q -format %s JobStatus` output. Empty output
    /// means the job is no longer known to the scheduler.
    pub fn parse(raw: &str) -> Self {
        let raw = raw.trim();
        if raw.is_empty() {
            return JobState::Gone;
        }
        raw.parse::<i32>()
            .map(JobState::from_code)
            .unwrap_or(JobState::Unknown)
    }

    /// No further progress without operator action.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Removed | JobState::Held | JobState::Gone
        )
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobState::Unknown => "unknown",
            JobState::Idle => "idle",
            JobState::Running => "running",
            JobState::Removed => "removed",
            JobState::Completed => "completed",
            JobState::Held => "held",
            JobState::TransferringOutput => "transferring_output",
            JobState::Suspended => "suspended",
            JobState::Gone => "gone",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    Absent,
    Creating,
    Running,
    Exited,
}

impl TunnelState {
    pub fn as_str(self) -> &'static str {
        match self {
            TunnelState::Absent => "absent",
            TunnelState::Creating => "creating",
            TunnelState::Running => "running",
            TunnelState::Exited => "exited",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobAction {
    Remove,
    Hold,
    Release,
}

/// Channels the controller publishes in its engine connection file.
pub const FORWARDED_CHANNELS: [&str; 7] = [
    "registration",
    "control",
    "mux",
    "hb_ping",
    "hb_pong",
    "task",
    "iopub",
];

/// Channel name to port, as read from `<name_pre>-engine.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PortForwardSpec {
    ports: BTreeMap<&'static str, u16>,
}

impl PortForwardSpec {
    /// Reads the channel ports out of the controller's engine file. Other keys
    /// (`interface`, `key`, `location`, ...) are ignored.
    pub fn from_json(contents: &str) -> LaunchResult<Self> {
        let entries: BTreeMap<String, serde_json::Value> = serde_json::from_str(contents)
            .map_err(|err| LaunchError::PortForward(format!("invalid JSON: {err}")))?;
        let mut ports = BTreeMap::new();
        for channel in FORWARDED_CHANNELS {
            let value = entries.get(channel).ok_or_else(|| {
                LaunchError::PortForward(format!("channel `{channel}` is missing"))
            })?;
            let port = value
                .as_u64()
                .and_then(|port| u16::try_from(port).ok())
                .filter(|port| *port != 0)
                .ok_or_else(|| {
                    LaunchError::PortForward(format!(
                        "channel `{channel}` has an invalid port: {value}"
                    ))
                })?;
            ports.insert(channel, port);
        }
        Ok(Self { ports })
    }

    pub fn port(&self, channel: &str) -> Option<u16> {
        self.ports.get(channel).copied()
    }

    /// `-R localhost:P:localhost:P` for every channel.
    pub fn reverse_forward_args(&self) -> Vec<String> {
        let mut args = Vec::with_capacity(self.ports.len() * 2);
        for channel in FORWARDED_CHANNELS {
            if let Some(port) = self.port(channel) {
                args.push("-R".to_string());
                args.push(format!("localhost:{port}:localhost:{port}"));
            }
        }
        args
    }
}

/// Snapshot taken on every poll tick.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollCycle {
    pub previous: JobState,
    pub current: JobState,
    pub elapsed: Duration,
    pub interval: Duration,
    /// The job has been seen running at least once.
    pub reached_running: bool,
}

/// Values substituted into the submit description template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitContext {
    pub exec_cmd: String,
    pub to_send: Vec<PathBuf>,
    pub engines: u32,
    pub name_pre: String,
    pub cluster_id: String,
    pub requirements: String,
    pub environments: String,
    pub proxy: String,
}

/// A rendered HTCondor submit description, ready for `condor_submit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmitDescription {
    pub file_name: String,
    pub body: String,
    pub engines: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StopCause {
    Requested,
    JobEnded(JobState),
    JobTimedOut,
    TunnelStartFailed,
    TunnelDied,
}

impl StopCause {
    pub fn as_str(&self) -> &'static str {
        match self {
            StopCause::Requested => "requested",
            StopCause::JobEnded(_) => "job_ended",
            StopCause::JobTimedOut => "job_timed_out",
            StopCause::TunnelStartFailed => "tunnel_start_failed",
            StopCause::TunnelDied => "tunnel_died",
        }
    }
}

/// Delivered to every stop callback.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StopReport {
    pub job: Option<JobHandle>,
    pub final_state: JobState,
    pub cause: StopCause,
    pub error: Option<LaunchError>,
}

impl StopReport {
    pub fn is_success(&self) -> bool {
        self.error.is_none() && self.final_state == JobState::Completed
    }
}

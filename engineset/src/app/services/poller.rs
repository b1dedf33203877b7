// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;

use crate::app::errors::LaunchError;
use crate::app::ports::{LocalHostPort, SchedulerPort};
use crate::app::services::hostname::{is_same_host, remote_machine};
use crate::app::services::tunnel::SshTunnelSupervisor;
use crate::app::types::{JobId, JobState, PollCycle, StopCause, TunnelState};

pub const JOB_STATUS_ATTR: &str = "JobStatus";
pub const REMOTE_HOST_ATTR: &str = "RemoteHost";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollSettings {
    /// Interval while the job is not running.
    pub interval: Duration,
    /// Interval once the job runs; its status rarely changes from there.
    pub running_interval: Duration,
    /// Give up if the job never reaches `Running` within this time.
    pub job_timeout: Duration,
}

impl Default for PollSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            running_interval: Duration::from_secs(20),
            job_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollDecision {
    Continue,
    BecameRunning,
    Finished(JobState),
    TimedOut,
    TunnelDied,
}

/// Transition rules, first match wins.
pub fn evaluate(cycle: &PollCycle, tunnel: TunnelState, job_timeout: Duration) -> PollDecision {
    if cycle.current == JobState::Running && cycle.previous != JobState::Running {
        return PollDecision::BecameRunning;
    }
    if cycle.current.is_terminal() {
        return PollDecision::Finished(cycle.current);
    }
    if !cycle.reached_running && cycle.elapsed > job_timeout {
        return PollDecision::TimedOut;
    }
    if cycle.current == JobState::Running && tunnel == TunnelState::Exited {
        return PollDecision::TunnelDied;
    }
    PollDecision::Continue
}

/// Why the poller asked for the launcher to stop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Termination {
    pub cause: StopCause,
    pub error: Option<LaunchError>,
}

/// Recurring status check of one submitted job.
pub struct JobPoller {
    job_id: JobId,
    scheduler: Arc<dyn SchedulerPort>,
    host: Arc<dyn LocalHostPort>,
    tunnel: Arc<SshTunnelSupervisor>,
    settings: PollSettings,
    started: Instant,
    previous: JobState,
    reached_running: bool,
    interval: Duration,
    state_tx: watch::Sender<JobState>,
}

impl JobPoller {
    pub fn new(
        job_id: JobId,
        scheduler: Arc<dyn SchedulerPort>,
        host: Arc<dyn LocalHostPort>,
        tunnel: Arc<SshTunnelSupervisor>,
        settings: PollSettings,
        state_tx: watch::Sender<JobState>,
    ) -> Self {
        Self {
            job_id,
            scheduler,
            host,
            tunnel,
            settings,
            started: Instant::now(),
            previous: JobState::Unknown,
            reached_running: false,
            interval: settings.interval,
            state_tx,
        }
    }

    /// Ticks until a terminal decision or until `cancel` flips, then hands the
    /// termination to `finish` (never after cancellation).
    pub async fn run<F, Fut>(mut self, mut cancel: watch::Receiver<bool>, finish: F)
    where
        F: FnOnce(Termination) -> Fut,
        Fut: Future<Output = ()>,
    {
        loop {
            if *cancel.borrow() {
                return;
            }
            let outcome = self.tick().await;
            if *cancel.borrow() {
                return;
            }
            if let Some(termination) = outcome {
                finish(termination).await;
                return;
            }
            tokio::select! {
                _ = cancel.changed() => return,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    /// One poll: query, evaluate, act. Returns `Some` when the launcher must stop.
    pub async fn tick(&mut self) -> Option<Termination> {
        let current = self.query_state().await;
        self.reached_running |= current == JobState::Running;
        let cycle = PollCycle {
            previous: self.previous,
            current,
            elapsed: self.started.elapsed(),
            interval: self.interval,
            reached_running: self.reached_running,
        };
        let tunnel = self.tunnel.ssh_state();
        let decision = evaluate(&cycle, tunnel, self.settings.job_timeout);
        if cycle.previous != current {
            tracing::info!(
                job_id = %self.job_id,
                from = %cycle.previous,
                to = %current,
                tunnel = tunnel.as_str(),
                "job state changed"
            );
        }

        self.previous = current;
        self.state_tx.send_replace(current);
        self.interval = if current == JobState::Running {
            self.settings.running_interval
        } else {
            self.settings.interval
        };

        match decision {
            PollDecision::Continue => None,
            PollDecision::BecameRunning => match self.open_tunnel().await {
                Ok(()) => None,
                Err(err) => Some(Termination {
                    cause: StopCause::TunnelStartFailed,
                    error: Some(err),
                }),
            },
            PollDecision::Finished(state) => Some(Termination {
                cause: StopCause::JobEnded(state),
                error: None,
            }),
            PollDecision::TimedOut => Some(Termination {
                cause: StopCause::JobTimedOut,
                error: Some(LaunchError::JobTimedOut {
                    job_id: self.job_id.to_string(),
                    status: current.code(),
                    elapsed_secs: cycle.elapsed.as_secs(),
                }),
            }),
            PollDecision::TunnelDied => Some(Termination {
                cause: StopCause::TunnelDied,
                error: Some(LaunchError::TunnelDied {
                    job_id: self.job_id.to_string(),
                    detail: self.tunnel.diagnostics_tail(5),
                }),
            }),
        }
    }

    async fn query_state(&self) -> JobState {
        match self
            .scheduler
            .query_attribute(&self.job_id, JOB_STATUS_ATTR)
            .await
        {
            Ok(raw) => JobState::parse(&raw),
            Err(err) => {
                tracing::debug!(job_id = %self.job_id, "status query failed, retrying next tick: {err}");
                JobState::Unknown
            }
        }
    }

    async fn open_tunnel(&self) -> Result<(), LaunchError> {
        let local = self.host.hostname();
        match self
            .scheduler
            .query_attribute(&self.job_id, REMOTE_HOST_ATTR)
            .await
        {
            Ok(raw) => {
                if let Some(machine) = remote_machine(&raw) {
                    if is_same_host(machine, &local) {
                        tracing::info!(job_id = %self.job_id, host = machine, "job runs on this host; no tunnel needed");
                        return Ok(());
                    }
                    tracing::debug!(job_id = %self.job_id, remote = machine, %local, "job runs remotely");
                }
            }
            Err(err) => {
                tracing::debug!(job_id = %self.job_id, "RemoteHost query failed, assuming remote: {err}");
            }
        }
        match self.tunnel.create_tunnel(&self.job_id).await {
            Ok(_pid) => Ok(()),
            Err(LaunchError::TunnelBusy(state)) => {
                tracing::debug!(job_id = %self.job_id, state, "tunnel already present");
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tokio::io::AsyncReadExt;
use tokio::process::{Child, Command};
use tracing::Instrument;

use crate::app::errors::{LaunchError, LaunchResult};
use crate::app::ports::LocalFilesystemPort;
use crate::app::services::pipe_reader::{LineBuffer, PipeReader};
use crate::app::types::{JobId, PortForwardSpec, TunnelState};

pub const DEFAULT_SSH_TO_JOB_PROGRAM: &str = "condor_ssh_to_job";
const EXIT_ON_FORWARD_FAILURE: [&str; 2] = ["-o", "ExitOnForwardFailure=yes"];
const FAILED_STDERR_READ_LIMIT: Duration = Duration::from_millis(500);

/// The forwarding program and how to invoke it for a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelCommand {
    pub program: String,
    /// Inserted before the job id, e.g. `-pool` / `-name` for a remote schedd.
    pub leading_args: Vec<String>,
}

impl Default for TunnelCommand {
    fn default() -> Self {
        Self {
            program: DEFAULT_SSH_TO_JOB_PROGRAM.to_string(),
            leading_args: Vec::new(),
        }
    }
}

impl TunnelCommand {
    pub fn args(&self, job_id: &JobId, ports: &PortForwardSpec) -> Vec<String> {
        let mut args = self.leading_args.clone();
        args.push(job_id.to_string());
        args.push("-N".to_string());
        args.extend(ports.reverse_forward_args());
        args.extend(EXIT_ON_FORWARD_FAILURE.iter().map(|s| s.to_string()));
        args
    }
}

#[derive(Debug, Clone)]
pub struct TunnelSettings {
    /// Engine connection file listing the controller ports.
    pub descriptor_path: PathBuf,
    /// A child that exits within this window failed to establish the forwards.
    pub liveness_grace: Duration,
    /// How long to wait for the child after SIGTERM.
    pub stop_grace: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelStopOutcome {
    NotRunning,
    Exited { code: Option<i32> },
    StillRunning { pid: u32 },
}

struct RunningTunnel {
    child: Child,
    pid: u32,
    stderr: PipeReader,
}

enum Slot {
    Absent,
    Creating,
    Running(RunningTunnel),
    Exited,
}

impl Slot {
    fn state(&self) -> TunnelState {
        match self {
            Slot::Absent => TunnelState::Absent,
            Slot::Creating => TunnelState::Creating,
            Slot::Running(_) => TunnelState::Running,
            Slot::Exited => TunnelState::Exited,
        }
    }
}

/// Owns the single `condor_ssh_to_job` child that reverse-forwards the
/// controller ports to the execute node.
pub struct SshTunnelSupervisor {
    command: TunnelCommand,
    settings: TunnelSettings,
    fs: Arc<dyn LocalFilesystemPort>,
    slot: Mutex<Slot>,
    diagnostics: LineBuffer,
    span: tracing::Span,
}

impl SshTunnelSupervisor {
    pub fn new(
        command: TunnelCommand,
        settings: TunnelSettings,
        fs: Arc<dyn LocalFilesystemPort>,
        span: tracing::Span,
    ) -> Self {
        Self {
            command,
            settings,
            fs,
            slot: Mutex::new(Slot::Absent),
            diagnostics: LineBuffer::default(),
            span,
        }
    }

    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Spawns the forwarding child and returns its pid once it has survived
    /// the liveness window. The slot must not be `Creating` or `Running`.
    pub async fn create_tunnel(&self, job_id: &JobId) -> LaunchResult<u32> {
        {
            let mut slot = self.slot();
            match &*slot {
                Slot::Creating => return Err(LaunchError::TunnelBusy("creating")),
                Slot::Running(_) => return Err(LaunchError::TunnelBusy("running")),
                Slot::Absent | Slot::Exited => *slot = Slot::Creating,
            }
        }

        let launched = self.launch(job_id).instrument(self.span.clone()).await;

        let mut slot = self.slot();
        match launched {
            Ok(running) => {
                if !matches!(&*slot, Slot::Creating) {
                    // stop_tunnel ran while we were starting
                    terminate(running.pid);
                    return Err(LaunchError::TunnelStartFailed(
                        "tunnel was stopped while starting".to_string(),
                    ));
                }
                let pid = running.pid;
                *slot = Slot::Running(running);
                self.span.in_scope(|| {
                    tracing::info!(pid, program = %self.command.program, "ssh tunnel started")
                });
                Ok(pid)
            }
            Err(err) => {
                if matches!(&*slot, Slot::Creating) {
                    *slot = Slot::Absent;
                }
                Err(err)
            }
        }
    }

    async fn launch(&self, job_id: &JobId) -> LaunchResult<RunningTunnel> {
        let descriptor = self
            .fs
            .read_to_string(&self.settings.descriptor_path)
            .await
            .map_err(|err| LaunchError::TunnelStartFailed(err.to_string()))?;
        let ports = PortForwardSpec::from_json(&descriptor)?;
        let args = self.command.args(job_id, &ports);
        tracing::debug!(program = %self.command.program, ?args, "spawning ssh tunnel");

        let mut child = Command::new(&self.command.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| {
                LaunchError::TunnelStartFailed(format!(
                    "failed to spawn {}: {err}",
                    self.command.program
                ))
            })?;
        let pid = child.id().unwrap_or_default();

        let waited = tokio::time::timeout(self.settings.liveness_grace, child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                let stderr = read_failed_stderr(&mut child).await;
                Err(LaunchError::TunnelStartFailed(format!(
                    "{} exited early ({}): {}",
                    self.command.program,
                    status,
                    stderr.trim()
                )))
            }
            Ok(Err(err)) => Err(LaunchError::TunnelStartFailed(format!(
                "failed to wait for {}: {err}",
                self.command.program
            ))),
            Err(_still_alive) => {
                let stderr = child.stderr.take().ok_or_else(|| {
                    LaunchError::TunnelStartFailed("stderr pipe missing".to_string())
                })?;
                let buffer = self.diagnostics.clone();
                let reader = PipeReader::spawn(
                    stderr,
                    Box::new(move |line| {
                        tracing::debug!(target: "engineset::tunnel", "{line}");
                        buffer.push(line);
                    }),
                    self.span.clone(),
                );
                Ok(RunningTunnel {
                    child,
                    pid,
                    stderr: reader,
                })
            }
        }
    }

    /// Observed state; notices a child that exited on its own.
    pub fn ssh_state(&self) -> TunnelState {
        let mut slot = self.slot();
        if let Slot::Running(tunnel) = &mut *slot {
            match tunnel.child.try_wait() {
                Ok(Some(status)) => {
                    let pid = tunnel.pid;
                    *slot = Slot::Exited;
                    self.span.in_scope(|| {
                        tracing::warn!(pid, %status, "ssh tunnel exited on its own")
                    });
                }
                Ok(None) => {}
                Err(err) => {
                    self.span
                        .in_scope(|| tracing::debug!("failed to poll ssh tunnel: {err}"));
                }
            }
        }
        slot.state()
    }

    /// Sends SIGTERM and waits briefly. Never escalates to SIGKILL.
    pub async fn stop_tunnel(&self) -> TunnelStopOutcome {
        let mut running = {
            let mut slot = self.slot();
            match std::mem::replace(&mut *slot, Slot::Exited) {
                Slot::Running(tunnel) => tunnel,
                Slot::Creating => return TunnelStopOutcome::NotRunning,
                other => {
                    *slot = other;
                    return TunnelStopOutcome::NotRunning;
                }
            }
        };
        let pid = running.pid;

        if let Ok(Some(status)) = running.child.try_wait() {
            drain(running.stderr).await;
            self.span
                .in_scope(|| tracing::info!(pid, %status, "ssh tunnel had already exited"));
            return TunnelStopOutcome::Exited {
                code: status.code(),
            };
        }

        terminate(pid);
        let waited = tokio::time::timeout(self.settings.stop_grace, running.child.wait()).await;
        match waited {
            Ok(Ok(status)) => {
                drain(running.stderr).await;
                self.span.in_scope(|| {
                    tracing::info!(
                        pid,
                        %status,
                        stderr = %self.diagnostics.tail(5),
                        "ssh tunnel exited"
                    )
                });
                TunnelStopOutcome::Exited {
                    code: status.code(),
                }
            }
            Ok(Err(err)) => {
                self.span
                    .in_scope(|| tracing::warn!(pid, "failed to wait for ssh tunnel: {err}"));
                TunnelStopOutcome::Exited { code: None }
            }
            Err(_) => {
                *self.slot() = Slot::Running(running);
                TunnelStopOutcome::StillRunning { pid }
            }
        }
    }

    /// Recent stderr output of the forwarding program.
    pub fn diagnostics_tail(&self, lines: usize) -> String {
        self.diagnostics.tail(lines)
    }
}

impl Drop for SshTunnelSupervisor {
    fn drop(&mut self) {
        let slot = self.slot.get_mut().unwrap_or_else(|p| p.into_inner());
        if let Slot::Running(tunnel) = slot {
            if let Ok(None) = tunnel.child.try_wait() {
                terminate(tunnel.pid);
            }
        }
    }
}

fn terminate(pid: u32) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    if raw <= 0 {
        return;
    }
    if let Err(err) = kill(Pid::from_raw(raw), Signal::SIGTERM) {
        tracing::debug!(pid, "SIGTERM failed: {err}");
    }
}

/// Lets the reader deliver the last lines of an exited child.
async fn drain(reader: PipeReader) {
    let _ = tokio::time::timeout(FAILED_STDERR_READ_LIMIT, reader.join()).await;
}

async fn read_failed_stderr(child: &mut Child) -> String {
    let Some(mut stderr) = child.stderr.take() else {
        return String::new();
    };
    let mut out = String::new();
    let _ = tokio::time::timeout(FAILED_STDERR_READ_LIMIT, stderr.read_to_string(&mut out)).await;
    out
}

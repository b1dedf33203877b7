// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use crate::app::errors::{LaunchError, LaunchResult};
use crate::app::ports::{LocalFilesystemPort, SchedulerPort};
use crate::app::types::{JobAction, JobId, SubmitDescription};

const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(60);

/// Drives HTCondor through its command-line tools on the submit host.
pub struct CondorCli {
    bin_dir: Option<PathBuf>,
    work_dir: PathBuf,
    fs: Arc<dyn LocalFilesystemPort>,
    command_timeout: Duration,
}

impl CondorCli {
    /// `work_dir` receives the submit description file; `bin_dir` overrides `PATH` lookup.
    pub fn new(
        work_dir: impl Into<PathBuf>,
        bin_dir: Option<PathBuf>,
        fs: Arc<dyn LocalFilesystemPort>,
    ) -> Self {
        Self {
            bin_dir,
            work_dir: work_dir.into(),
            fs,
            command_timeout: DEFAULT_COMMAND_TIMEOUT,
        }
    }

    fn program(&self, tool: &str) -> PathBuf {
        match &self.bin_dir {
            Some(dir) => dir.join(tool),
            None => PathBuf::from(tool),
        }
    }

    /// Runs `tool` and returns its stdout, or a message built from stderr.
    async fn run(&self, tool: &str, args: &[&str]) -> Result<String, String> {
        let program = self.program(tool);
        tracing::debug!(program = %program.display(), ?args, "running condor tool");
        let mut command = Command::new(&program);
        command
            .args(args)
            .current_dir(&self.work_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let output = match tokio::time::timeout(self.command_timeout, command.output()).await {
            Ok(Ok(output)) => output,
            Ok(Err(err)) => return Err(format!("failed to run {tool}: {err}")),
            Err(_) => {
                return Err(format!(
                    "{tool} did not finish within {}s",
                    self.command_timeout.as_secs()
                ));
            }
        };
        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let detail = if stderr.trim().is_empty() {
                stdout.trim().to_string()
            } else {
                stderr.trim().to_string()
            };
            return Err(format!("{tool} failed ({}): {detail}", output.status));
        }
        Ok(stdout)
    }
}

/// Finds the cluster id in `condor_submit` output ("... submitted to cluster 4711.").
pub fn parse_cluster_id(stdout: &str) -> Option<JobId> {
    stdout.lines().find_map(|line| {
        let (_, rest) = line.split_once("submitted to cluster")?;
        let id = rest.trim().trim_end_matches('.');
        if !id.is_empty() && id.chars().all(|ch| ch.is_ascii_digit()) {
            Some(JobId::new(id))
        } else {
            None
        }
    })
}

fn action_tool(action: JobAction) -> &'static str {
    match action {
        JobAction::Remove => "condor_rm",
        JobAction::Hold => "condor_hold",
        JobAction::Release => "condor_release",
    }
}

#[async_trait]
impl SchedulerPort for CondorCli {
    #[tracing::instrument(name = "condor", level = "debug", skip(self, description), fields(op = "submit", file = %description.file_name))]
    async fn submit(&self, description: &SubmitDescription) -> LaunchResult<JobId> {
        let path = self.work_dir.join(&description.file_name);
        self.fs.write(&path, &description.body).await?;
        let path_arg = path.to_string_lossy();
        let stdout = self
            .run("condor_submit", &[path_arg.as_ref()])
            .await
            .map_err(LaunchError::Submission)?;
        parse_cluster_id(&stdout).ok_or_else(|| {
            LaunchError::Submission(format!(
                "could not find a cluster id in condor_submit output: {}",
                stdout.trim()
            ))
        })
    }

    #[tracing::instrument(name = "condor", level = "debug", skip(self), fields(op = "query_attribute"))]
    async fn query_attribute(&self, job_id: &JobId, attribute: &str) -> LaunchResult<String> {
        let stdout = self
            .run("condor_q", &["-format", "%s", attribute, job_id.as_str()])
            .await
            .map_err(LaunchError::PollQuery)?;
        let value = stdout.trim();
        if !value.is_empty() {
            return Ok(value.to_string());
        }
        // finished jobs drop out of the queue and only live on in the history
        let args = ["-limit", "1", "-format", "%s", attribute, job_id.as_str()];
        match self.run("condor_history", &args).await {
            Ok(stdout) => Ok(stdout.trim().to_string()),
            Err(err) => {
                tracing::debug!(%job_id, "condor_history lookup failed: {err}");
                Ok(String::new())
            }
        }
    }

    #[tracing::instrument(name = "condor", level = "debug", skip(self), fields(op = "act"))]
    async fn act(&self, job_id: &JobId, action: JobAction) -> LaunchResult<()> {
        let tool = action_tool(action);
        self.run(tool, &[job_id.as_str()])
            .await
            .map(|_| ())
            .map_err(LaunchError::Io)
    }
}

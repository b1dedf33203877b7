// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::kill;
use nix::unistd::Pid;

use crate::app::ports::{ControllerProbePort, LocalFilesystemPort};

/// Treats the controller as ready when its pid file names a live process.
pub struct PidFileProbe {
    pid_file: PathBuf,
    fs: Arc<dyn LocalFilesystemPort>,
}

impl PidFileProbe {
    pub fn new(pid_file: impl Into<PathBuf>, fs: Arc<dyn LocalFilesystemPort>) -> Self {
        Self {
            pid_file: pid_file.into(),
            fs,
        }
    }
}

fn parse_pid(contents: &str) -> Option<i32> {
    contents
        .split_whitespace()
        .next()?
        .parse::<i32>()
        .ok()
        .filter(|pid| *pid > 0)
}

fn process_alive(pid: i32) -> bool {
    // EPERM: the process exists but belongs to someone else
    matches!(kill(Pid::from_raw(pid), None), Ok(()) | Err(Errno::EPERM))
}

#[async_trait]
impl ControllerProbePort for PidFileProbe {
    #[tracing::instrument(name = "controller", level = "debug", skip(self), fields(op = "is_ready", pid_file = %self.pid_file.display()))]
    async fn is_ready(&self) -> bool {
        let contents = match self.fs.read_to_string(&self.pid_file).await {
            Ok(contents) => contents,
            Err(err) => {
                tracing::debug!("controller pid file not readable: {err}");
                return false;
            }
        };
        match parse_pid(&contents) {
            Some(pid) => process_alive(pid),
            None => {
                tracing::debug!(contents = contents.trim(), "controller pid file is malformed");
                false
            }
        }
    }

    fn location(&self) -> String {
        self.pid_file.display().to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    use crate::adapters::fs::LocalFilesystem;

    fn probe(dir: &TempDir, contents: Option<&str>) -> PidFileProbe {
        let pid_file = dir.path().join("pid").join("ipcontroller.pid");
        if let Some(contents) = contents {
            std::fs::create_dir_all(pid_file.parent().unwrap()).unwrap();
            std::fs::write(&pid_file, contents).unwrap();
        }
        PidFileProbe::new(pid_file, Arc::new(LocalFilesystem::new()))
    }

    #[test]
    fn parses_the_first_token() {
        assert_eq!(parse_pid("4242\n"), Some(4242));
        assert_eq!(parse_pid("  17  "), Some(17));
        assert_eq!(parse_pid(""), None);
        assert_eq!(parse_pid("0"), None);
        assert_eq!(parse_pid("not-a-pid"), None);
    }

    #[tokio::test]
    async fn live_pid_is_ready() {
        let dir = TempDir::new().unwrap();
        let probe = probe(&dir, Some(&format!("{}\n", std::process::id())));
        assert!(probe.is_ready().await);
        assert!(probe.location().ends_with("pid/ipcontroller.pid"));
    }

    #[tokio::test]
    async fn missing_or_stale_pid_file_is_not_ready() {
        let dir = TempDir::new().unwrap();
        assert!(!probe(&dir, None).is_ready().await);

        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        let stale = TempDir::new().unwrap();
        assert!(!probe(&stale, Some(&pid.to_string())).is_ready().await);
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::time::Duration;

use tokio::time::Instant;

use crate::app::errors::{LaunchError, LaunchResult};
use crate::app::ports::ControllerProbePort;

const PROBE_STEP: Duration = Duration::from_secs(1);

/// Waits up to `wait` for the controller to report ready, probing once per second.
pub async fn wait_for_controller(
    probe: &dyn ControllerProbePort,
    wait: Duration,
) -> LaunchResult<()> {
    let started = Instant::now();
    loop {
        if probe.is_ready().await {
            tracing::debug!(
                location = %probe.location(),
                waited_ms = started.elapsed().as_millis() as u64,
                "controller is ready"
            );
            return Ok(());
        }
        let elapsed = started.elapsed();
        if elapsed >= wait {
            return Err(LaunchError::ControllerNotReady {
                location: probe.location(),
                waited_secs: wait.as_secs(),
            });
        }
        tokio::time::sleep(PROBE_STEP.min(wait - elapsed)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ReadyAfter {
        probes: AtomicUsize,
        ready_on: usize,
    }

    #[async_trait::async_trait]
    impl ControllerProbePort for ReadyAfter {
        async fn is_ready(&self) -> bool {
            self.probes.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_on
        }

        fn location(&self) -> String {
            "/tmp/pid/ipcontroller.pid".to_string()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn returns_once_the_controller_comes_up() {
        let probe = ReadyAfter {
            probes: AtomicUsize::new(0),
            ready_on: 3,
        };
        wait_for_controller(&probe, Duration::from_secs(20))
            .await
            .unwrap();
        assert_eq!(probe.probes.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_the_wait_bound() {
        let probe = ReadyAfter {
            probes: AtomicUsize::new(0),
            ready_on: usize::MAX,
        };
        let started = Instant::now();
        let err = wait_for_controller(&probe, Duration::from_secs(20))
            .await
            .unwrap_err();
        assert_eq!(
            err,
            LaunchError::ControllerNotReady {
                location: "/tmp/pid/ipcontroller.pid".into(),
                waited_secs: 20
            }
        );
        assert_eq!(started.elapsed(), Duration::from_secs(20));
        assert_eq!(probe.probes.load(Ordering::SeqCst), 21);
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::Instrument;

use crate::app::errors::{LaunchError, LaunchResult};
use crate::app::ports::{
    ClockPort, ControllerProbePort, LocalFilesystemPort, LocalHostPort, SchedulerPort,
};
use crate::app::services::poller::{JobPoller, PollSettings, Termination};
use crate::app::services::readiness::wait_for_controller;
use crate::app::services::submit_description::{
    self, DEFAULT_BATCH_FILE_NAME, DEFAULT_BATCH_TEMPLATE,
};
use crate::app::services::tunnel::{
    SshTunnelSupervisor, TunnelCommand, TunnelSettings, TunnelStopOutcome,
};
use crate::app::types::{
    JobAction, JobHandle, JobState, StopCause, StopReport, SubmitContext, TunnelState,
};

/// Everything the launcher needs to know about the profile and the timing knobs.
#[derive(Debug, Clone)]
pub struct LaunchSettings {
    pub profile_dir: PathBuf,
    pub cluster_id: Option<String>,
    /// Defaults to `<profile_dir>/ipengine_launcher`.
    pub exec_cmd: Option<String>,
    /// Extra files shipped with the job, after the engine connection file.
    pub to_send: Vec<PathBuf>,
    pub requirements: String,
    pub environments: String,
    pub x509_user_proxy: Option<String>,
    pub batch_file_name: String,
    pub batch_template: String,
    pub controller_wait: Duration,
    pub poll: PollSettings,
    pub tunnel_grace: Duration,
    pub tunnel_stop_grace: Duration,
    pub tunnel_command: TunnelCommand,
    pub remove_job_on_stop: bool,
}

impl LaunchSettings {
    pub fn new(profile_dir: impl Into<PathBuf>) -> Self {
        Self {
            profile_dir: profile_dir.into(),
            cluster_id: None,
            exec_cmd: None,
            to_send: Vec::new(),
            requirements: String::new(),
            environments: String::new(),
            x509_user_proxy: None,
            batch_file_name: DEFAULT_BATCH_FILE_NAME.to_string(),
            batch_template: DEFAULT_BATCH_TEMPLATE.to_string(),
            controller_wait: Duration::from_secs(20),
            poll: PollSettings::default(),
            tunnel_grace: Duration::from_secs(2),
            tunnel_stop_grace: Duration::from_secs(1),
            tunnel_command: TunnelCommand::default(),
            remove_job_on_stop: true,
        }
    }

    /// `ipcontroller-<cluster_id>`, or `ipcontroller` without a cluster id.
    pub fn name_pre(&self) -> String {
        match self.cluster_id.as_deref().filter(|id| !id.is_empty()) {
            Some(id) => format!("ipcontroller-{id}"),
            None => "ipcontroller".to_string(),
        }
    }

    pub fn descriptor_path(&self) -> PathBuf {
        self.profile_dir
            .join("security")
            .join(format!("{}-engine.json", self.name_pre()))
    }

    pub fn controller_pid_file(&self) -> PathBuf {
        self.profile_dir
            .join("pid")
            .join(format!("{}.pid", self.name_pre()))
    }

    pub fn exec_cmd(&self) -> String {
        match &self.exec_cmd {
            Some(cmd) => cmd.clone(),
            None => self
                .profile_dir
                .join("ipengine_launcher")
                .to_string_lossy()
                .into_owned(),
        }
    }
}

type StopCallback = Box<dyn FnOnce(&StopReport) + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Idle,
    Starting,
    Started,
    Stopped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Origin {
    Caller,
    Poller,
}

/// Cancels the poller task when dropped.
struct PollerTask {
    cancel: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl Drop for PollerTask {
    fn drop(&mut self) {
        let _ = self.cancel.send(true);
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

struct Shared {
    phase: Phase,
    job: Option<JobHandle>,
    state_tx: Option<watch::Sender<JobState>>,
    poller: Option<PollerTask>,
    callbacks: Vec<StopCallback>,
    report: Option<StopReport>,
}

struct Inner {
    settings: LaunchSettings,
    scheduler: Arc<dyn SchedulerPort>,
    fs: Arc<dyn LocalFilesystemPort>,
    controller: Arc<dyn ControllerProbePort>,
    host: Arc<dyn LocalHostPort>,
    clock: Arc<dyn ClockPort>,
    tunnel: Arc<SshTunnelSupervisor>,
    /// Flipped once, under the `shared` lock, by the first shutdown.
    stopping: watch::Sender<bool>,
    shared: Mutex<Shared>,
    state_rx: watch::Receiver<JobState>,
    done: watch::Sender<bool>,
    span: tracing::Span,
}

/// Submits the engine job, watches it, keeps the reverse tunnel up while it
/// runs and tears everything down on the way out.
///
/// Failures before submission come back from [`start`](Self::start); anything
/// later is delivered to the callbacks registered with [`on_stop`](Self::on_stop).
#[derive(Clone)]
pub struct EngineLaunchSupervisor {
    inner: Arc<Inner>,
}

impl EngineLaunchSupervisor {
    pub fn new(
        settings: LaunchSettings,
        scheduler: Arc<dyn SchedulerPort>,
        fs: Arc<dyn LocalFilesystemPort>,
        controller: Arc<dyn ControllerProbePort>,
        host: Arc<dyn LocalHostPort>,
        clock: Arc<dyn ClockPort>,
    ) -> Self {
        let span = tracing::info_span!(
            "engineset",
            cluster_id = settings.cluster_id.as_deref().unwrap_or(""),
            job_id = tracing::field::Empty
        );
        let tunnel = Arc::new(SshTunnelSupervisor::new(
            settings.tunnel_command.clone(),
            TunnelSettings {
                descriptor_path: settings.descriptor_path(),
                liveness_grace: settings.tunnel_grace,
                stop_grace: settings.tunnel_stop_grace,
            },
            fs.clone(),
            tracing::info_span!(parent: &span, "tunnel"),
        ));
        let (state_tx, state_rx) = watch::channel(JobState::Unknown);
        let (stopping, _) = watch::channel(false);
        let (done, _) = watch::channel(false);
        Self {
            inner: Arc::new(Inner {
                settings,
                scheduler,
                fs,
                controller,
                host,
                clock,
                tunnel,
                stopping,
                shared: Mutex::new(Shared {
                    phase: Phase::Idle,
                    job: None,
                    state_tx: Some(state_tx),
                    poller: None,
                    callbacks: Vec::new(),
                    report: None,
                }),
                state_rx,
                done,
                span,
            }),
        }
    }

    /// Submits a job for `engines` engines and starts polling it. Returns as
    /// soon as the scheduler acknowledged the submission.
    pub async fn start(&self, engines: u32) -> LaunchResult<JobHandle> {
        if engines == 0 {
            return Err(LaunchError::InvalidEngineCount);
        }
        {
            let mut shared = self.inner.shared();
            if shared.phase != Phase::Idle || *self.inner.stopping.borrow() {
                return Err(LaunchError::AlreadyStarted);
            }
            shared.phase = Phase::Starting;
        }

        let submitted = self
            .inner
            .submit(engines)
            .instrument(self.inner.span.clone())
            .await;
        let handle = match submitted {
            Ok(handle) => handle,
            Err(err) => {
                let mut shared = self.inner.shared();
                if shared.phase == Phase::Starting {
                    shared.phase = Phase::Idle;
                }
                return Err(err);
            }
        };

        self.inner.span.record("job_id", handle.job_id.as_str());
        let installed = {
            let mut shared = self.inner.shared();
            if *self.inner.stopping.borrow() {
                false
            } else {
                let Some(state_tx) = shared.state_tx.take() else {
                    return Err(LaunchError::AlreadyStarted);
                };
                shared.poller = Some(self.spawn_poller(&handle, state_tx));
                shared.job = Some(handle.clone());
                shared.phase = Phase::Started;
                true
            }
        };
        if !installed {
            // stop() ran while condor_submit was in flight
            self.inner.remove_job(&handle).await;
            return Err(LaunchError::Stopped);
        }
        Ok(handle)
    }

    fn spawn_poller(&self, handle: &JobHandle, state_tx: watch::Sender<JobState>) -> PollerTask {
        let poller = JobPoller::new(
            handle.job_id.clone(),
            self.inner.scheduler.clone(),
            self.inner.host.clone(),
            self.inner.tunnel.clone(),
            self.inner.settings.poll,
            state_tx,
        );
        let (cancel, cancel_rx) = watch::channel(false);
        let weak = Arc::downgrade(&self.inner);
        let span = tracing::info_span!(parent: &self.inner.span, "poller");
        let task = tokio::spawn(
            poller
                .run(cancel_rx, move |termination| async move {
                    if let Some(inner) = weak.upgrade() {
                        inner.shutdown(termination, Origin::Poller).await;
                    }
                })
                .instrument(span),
        );
        PollerTask {
            cancel,
            handle: Some(task),
        }
    }

    /// Cancels polling, terminates the tunnel and runs the stop callbacks.
    /// Safe to call any number of times; later calls wait for the first to finish.
    pub async fn stop(&self) {
        let mut done = self.inner.done.subscribe();
        self.inner
            .shutdown(
                Termination {
                    cause: StopCause::Requested,
                    error: None,
                },
                Origin::Caller,
            )
            .await;
        let _ = done.wait_for(|finished| *finished).await;
    }

    /// Registers `callback` to run once when the launcher stops. Runs it right
    /// away if that already happened.
    pub fn on_stop<F>(&self, callback: F)
    where
        F: FnOnce(&StopReport) + Send + 'static,
    {
        let report = {
            let mut shared = self.inner.shared();
            match &shared.report {
                Some(report) => report.clone(),
                None => {
                    shared.callbacks.push(Box::new(callback));
                    return;
                }
            }
        };
        callback(&report);
    }

    pub fn job(&self) -> Option<JobHandle> {
        self.inner.shared().job.clone()
    }

    pub fn job_state(&self) -> JobState {
        *self.inner.state_rx.borrow()
    }

    pub fn tunnel_state(&self) -> TunnelState {
        self.inner.tunnel.ssh_state()
    }

    pub fn report(&self) -> Option<StopReport> {
        self.inner.shared().report.clone()
    }
}

impl Inner {
    fn shared(&self) -> MutexGuard<'_, Shared> {
        self.shared.lock().unwrap_or_else(|p| p.into_inner())
    }

    async fn submit(&self, engines: u32) -> LaunchResult<JobHandle> {
        let settings = &self.settings;
        submit_description::validate_clause("requirements", &settings.requirements)?;
        submit_description::validate_clause("environments", &settings.environments)?;

        let mut stop_rx = self.stopping.subscribe();
        tokio::select! {
            ready = wait_for_controller(self.controller.as_ref(), settings.controller_wait) => ready?,
            _ = stop_rx.wait_for(|stopping| *stopping) => return Err(LaunchError::Stopped),
        }

        let mut to_send = vec![settings.descriptor_path()];
        to_send.extend(settings.to_send.iter().cloned());
        for path in &to_send {
            if !self.fs.exists(path).await {
                return Err(LaunchError::MissingInputFile { path: path.clone() });
            }
        }

        let proxy = settings
            .x509_user_proxy
            .clone()
            .or_else(|| std::env::var("X509_USER_PROXY").ok());
        let context = SubmitContext {
            exec_cmd: settings.exec_cmd(),
            to_send,
            engines,
            name_pre: settings.name_pre(),
            cluster_id: settings.cluster_id.clone().unwrap_or_default(),
            requirements: settings.requirements.clone(),
            environments: settings.environments.clone(),
            proxy: submit_description::proxy_clause(proxy.as_deref()),
        };
        tracing::debug!(?context, "submitting condor job");
        let description = submit_description::render(
            &settings.batch_template,
            &settings.batch_file_name,
            &context,
        )?;

        if *self.stopping.borrow() {
            return Err(LaunchError::Stopped);
        }
        let job_id = self.scheduler.submit(&description).await?;
        tracing::info!(%job_id, engines, "condor job submitted");
        Ok(JobHandle {
            job_id,
            submitted_at: self.clock.now_utc(),
            engines,
        })
    }

    /// The single cleanup path. Only the first caller does the work.
    async fn shutdown(&self, termination: Termination, origin: Origin) {
        let poller = {
            let mut shared = self.shared();
            if self.stopping.send_replace(true) {
                return;
            }
            shared.poller.take()
        };
        let span = self.span.clone();
        async {
            if let Some(mut poller) = poller {
                let _ = poller.cancel.send(true);
                let handle = poller.handle.take();
                if origin == Origin::Caller {
                    if let Some(handle) = handle {
                        let _ = handle.await;
                    }
                }
            }

            match self.tunnel.stop_tunnel().await {
                TunnelStopOutcome::NotRunning => {}
                TunnelStopOutcome::Exited { code } => {
                    tracing::debug!(?code, "ssh tunnel stopped");
                }
                TunnelStopOutcome::StillRunning { pid } => {
                    tracing::warn!("{}", LaunchError::GracefulStopTimeout { pid });
                }
            }

            let final_state = *self.state_rx.borrow();
            let job = self.shared().job.clone();
            if let Some(handle) = &job {
                if self.settings.remove_job_on_stop && !final_state.is_terminal() {
                    self.remove_job(handle).await;
                }
            }

            let report = StopReport {
                job,
                final_state,
                cause: termination.cause,
                error: termination.error,
            };
            match &report.error {
                Some(err) => tracing::error!(
                    cause = report.cause.as_str(),
                    state = %final_state,
                    code = err.code(),
                    "engine launcher stopped: {err}"
                ),
                None => tracing::info!(
                    cause = report.cause.as_str(),
                    state = %final_state,
                    "engine launcher stopped"
                ),
            }

            let callbacks = {
                let mut shared = self.shared();
                shared.phase = Phase::Stopped;
                shared.report = Some(report.clone());
                std::mem::take(&mut shared.callbacks)
            };
            for callback in callbacks {
                callback(&report);
            }
            self.done.send_replace(true);
        }
        .instrument(span)
        .await
    }

    async fn remove_job(&self, handle: &JobHandle) {
        match self.scheduler.act(&handle.job_id, JobAction::Remove).await {
            Ok(()) => tracing::info!(job_id = %handle.job_id, "condor job removed"),
            Err(err) => {
                tracing::warn!(job_id = %handle.job_id, "failed to remove condor job: {err}")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Instant;

    use tempfile::TempDir;
    use tokio::sync::mpsc;

    use crate::adapters::fs::LocalFilesystem;
    use crate::adapters::system::SystemClock;
    use crate::app::services::poller::{JOB_STATUS_ATTR, REMOTE_HOST_ATTR};
    use crate::app::types::{JobId, SubmitDescription};

    const ENGINE_FILE: &str = r#"{"registration":10001,"control":10002,"mux":10003,"hb_ping":10004,"hb_pong":10005,"task":10006,"iopub":10007}"#;
    const LOCAL_HOSTNAME: &str = "node7.cluster.org";

    #[derive(Default)]
    struct FakeScheduler {
        statuses: Mutex<VecDeque<&'static str>>,
        last_status: Mutex<&'static str>,
        remote_host: Mutex<String>,
        status_queries: AtomicUsize,
        submitted: Mutex<Vec<SubmitDescription>>,
        submit_delay: Mutex<Duration>,
        actions: Mutex<Vec<(JobId, JobAction)>>,
    }

    impl FakeScheduler {
        /// `"ERR"` makes the query fail; the last entry repeats forever.
        fn new(statuses: &[&'static str], remote_host: &str) -> Arc<Self> {
            Arc::new(Self {
                statuses: Mutex::new(statuses.iter().copied().collect()),
                last_status: Mutex::new("1"),
                remote_host: Mutex::new(remote_host.to_string()),
                ..Self::default()
            })
        }

        fn submissions(&self) -> Vec<SubmitDescription> {
            self.submitted.lock().unwrap().clone()
        }

        fn actions(&self) -> Vec<(JobId, JobAction)> {
            self.actions.lock().unwrap().clone()
        }
    }

    #[async_trait::async_trait]
    impl SchedulerPort for FakeScheduler {
        async fn submit(&self, description: &SubmitDescription) -> LaunchResult<JobId> {
            let delay = *self.submit_delay.lock().unwrap();
            tokio::time::sleep(delay).await;
            self.submitted.lock().unwrap().push(description.clone());
            Ok(JobId::new("4711"))
        }

        async fn query_attribute(&self, _job_id: &JobId, attribute: &str) -> LaunchResult<String> {
            match attribute {
                JOB_STATUS_ATTR => {
                    self.status_queries.fetch_add(1, Ordering::SeqCst);
                    let next = self.statuses.lock().unwrap().pop_front();
                    let status = match next {
                        Some(status) => {
                            *self.last_status.lock().unwrap() = status;
                            status
                        }
                        None => *self.last_status.lock().unwrap(),
                    };
                    if status == "ERR" {
                        Err(LaunchError::PollQuery("condor_q: schedd unreachable".into()))
                    } else {
                        Ok(status.to_string())
                    }
                }
                REMOTE_HOST_ATTR => Ok(self.remote_host.lock().unwrap().clone()),
                other => panic!("unexpected attribute {other}"),
            }
        }

        async fn act(&self, job_id: &JobId, action: JobAction) -> LaunchResult<()> {
            self.actions.lock().unwrap().push((job_id.clone(), action));
            Ok(())
        }
    }

    /// Never ready when `ready_at` is `None`.
    struct FakeController {
        ready_at: Option<Instant>,
    }

    #[async_trait::async_trait]
    impl ControllerProbePort for FakeController {
        async fn is_ready(&self) -> bool {
            self.ready_at.is_some_and(|at| Instant::now() >= at)
        }

        fn location(&self) -> String {
            "pid/ipcontroller.pid".to_string()
        }
    }

    struct FixedHost;

    impl LocalHostPort for FixedHost {
        fn hostname(&self) -> String {
            LOCAL_HOSTNAME.to_string()
        }
    }

    struct Harness {
        dir: TempDir,
        settings: LaunchSettings,
        scheduler: Arc<FakeScheduler>,
        controller_ready_after: Option<Duration>,
    }

    impl Harness {
        fn new(statuses: &[&'static str], remote_host: &str) -> Self {
            let dir = TempDir::new().unwrap();
            let mut settings = LaunchSettings::new(dir.path());
            std::fs::create_dir_all(dir.path().join("security")).unwrap();
            std::fs::write(settings.descriptor_path(), ENGINE_FILE).unwrap();
            settings.controller_wait = Duration::ZERO;
            settings.poll = PollSettings {
                interval: Duration::from_millis(20),
                running_interval: Duration::from_millis(50),
                job_timeout: Duration::from_millis(300),
            };
            settings.tunnel_grace = Duration::from_millis(200);
            settings.tunnel_stop_grace = Duration::from_secs(2);
            let mut harness = Self {
                dir,
                settings,
                scheduler: FakeScheduler::new(statuses, remote_host),
                controller_ready_after: Some(Duration::ZERO),
            };
            harness.tunnel_script("exec sleep 30");
            harness
        }

        fn marker(&self) -> PathBuf {
            self.dir.path().join("tunnel-spawns")
        }

        fn tunnel_script(&mut self, body: &str) {
            let script = format!("echo spawned >> '{}'; {body}", self.marker().display());
            self.settings.tunnel_command = TunnelCommand {
                program: "sh".to_string(),
                leading_args: vec!["-c".to_string(), script, "ssh-stub".to_string()],
            };
        }

        fn tunnel_spawns(&self) -> usize {
            std::fs::read_to_string(self.marker())
                .map(|s| s.lines().count())
                .unwrap_or(0)
        }

        fn supervisor(&self) -> EngineLaunchSupervisor {
            EngineLaunchSupervisor::new(
                self.settings.clone(),
                self.scheduler.clone(),
                Arc::new(LocalFilesystem::new()),
                Arc::new(FakeController {
                    ready_at: self
                        .controller_ready_after
                        .map(|after| Instant::now() + after),
                }),
                Arc::new(FixedHost),
                Arc::new(SystemClock::new()),
            )
        }
    }

    fn collect_reports(supervisor: &EngineLaunchSupervisor) -> mpsc::UnboundedReceiver<StopReport> {
        let (tx, rx) = mpsc::unbounded_channel();
        supervisor.on_stop(move |report| {
            let _ = tx.send(report.clone());
        });
        rx
    }

    async fn next_report(rx: &mut mpsc::UnboundedReceiver<StopReport>) -> StopReport {
        tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .expect("launcher did not stop in time")
            .expect("report channel closed")
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn stale_controller_blocks_submission() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        harness.controller_ready_after = None;
        let err = harness.supervisor().start(4).await.unwrap_err();
        assert!(matches!(err, LaunchError::ControllerNotReady { .. }), "{err:?}");
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[tokio::test]
    async fn stop_during_controller_wait_submits_nothing() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        harness.settings.controller_wait = Duration::from_secs(5);
        harness.controller_ready_after = Some(Duration::from_millis(400));
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        let starting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start(2).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop().await;

        let started = tokio::time::timeout(Duration::from_millis(500), starting)
            .await
            .expect("start kept waiting for the controller after stop")
            .unwrap();
        assert_eq!(started.unwrap_err(), LaunchError::Stopped);
        assert_eq!(next_report(&mut reports).await.cause, StopCause::Requested);

        // well past the point where the controller turns ready
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(harness.scheduler.submissions().is_empty());
        assert!(harness.scheduler.actions().is_empty());
        assert_eq!(harness.scheduler.status_queries.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.start(2).await.unwrap_err(), LaunchError::AlreadyStarted);
    }

    #[tokio::test]
    async fn stop_during_condor_submit_removes_the_new_job() {
        let harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        *harness.scheduler.submit_delay.lock().unwrap() = Duration::from_millis(300);
        let supervisor = harness.supervisor();

        let starting = {
            let supervisor = supervisor.clone();
            tokio::spawn(async move { supervisor.start(2).await })
        };
        wait_until(|| supervisor.inner.shared().phase == Phase::Starting).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        supervisor.stop().await;

        assert_eq!(starting.await.unwrap().unwrap_err(), LaunchError::Stopped);
        assert_eq!(harness.scheduler.submissions().len(), 1);
        assert_eq!(
            harness.scheduler.actions(),
            vec![(JobId::new("4711"), JobAction::Remove)]
        );
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.scheduler.status_queries.load(Ordering::SeqCst), 0);
        assert_eq!(supervisor.job(), None);
        assert_eq!(harness.tunnel_spawns(), 0);
    }

    #[tokio::test]
    async fn missing_input_file_blocks_submission() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let missing = harness.dir.path().join("data.h5");
        harness.settings.to_send = vec![missing.clone()];
        let err = harness.supervisor().start(4).await.unwrap_err();
        assert_eq!(err, LaunchError::MissingInputFile { path: missing });
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[tokio::test]
    async fn malformed_requirements_block_submission() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        harness.settings.requirements = "(Memory > 2048)".to_string();
        let err = harness.supervisor().start(4).await.unwrap_err();
        assert_eq!(err.code(), crate::app::errors::codes::INVALID_REQUIREMENT_SYNTAX);
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[tokio::test]
    async fn zero_engines_is_rejected() {
        let harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let err = harness.supervisor().start(0).await.unwrap_err();
        assert_eq!(err, LaunchError::InvalidEngineCount);
    }

    #[tokio::test]
    async fn submission_carries_engine_count_and_files() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let extra = harness.dir.path().join("model.bin");
        std::fs::write(&extra, b"weights").unwrap();
        harness.settings.to_send = vec![extra.clone()];
        harness.settings.cluster_id = None;
        let supervisor = harness.supervisor();

        let handle = supervisor.start(4).await.unwrap();
        assert_eq!(handle.job_id, JobId::new("4711"));
        assert_eq!(handle.engines, 4);
        assert_eq!(supervisor.job(), Some(handle));

        let submissions = harness.scheduler.submissions();
        assert_eq!(submissions.len(), 1);
        let body = &submissions[0].body;
        assert!(body.contains("mpiexec --n 4 ipengine"));
        let expected = format!(
            "transfer_input_files = {},{}",
            harness.settings.descriptor_path().display(),
            extra.display()
        );
        assert!(body.contains(&expected), "{body}");

        assert_eq!(supervisor.start(4).await.unwrap_err(), LaunchError::AlreadyStarted);
        supervisor.stop().await;
    }

    #[tokio::test]
    async fn job_that_never_runs_times_out_once() {
        let harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        supervisor.on_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        let mut reports = collect_reports(&supervisor);

        supervisor.start(2).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::JobTimedOut);
        assert_eq!(report.final_state, JobState::Idle);
        assert!(matches!(report.error, Some(LaunchError::JobTimedOut { status: 1, .. })));

        supervisor.stop().await;
        supervisor.stop().await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            harness.scheduler.actions(),
            vec![(JobId::new("4711"), JobAction::Remove)]
        );
        assert_eq!(harness.tunnel_spawns(), 0);
    }

    #[tokio::test]
    async fn local_job_completes_without_a_tunnel() {
        let harness = Harness::new(&["1", "2", "2", "4"], "slot1@Node7.cluster.org");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(1).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::JobEnded(JobState::Completed));
        assert_eq!(report.final_state, JobState::Completed);
        assert!(report.is_success());
        assert_eq!(harness.tunnel_spawns(), 0);
        // terminal jobs are left alone
        assert!(harness.scheduler.actions().is_empty());
    }

    #[tokio::test]
    async fn job_leaving_the_queue_ends_the_launcher() {
        let harness = Harness::new(&["1", "2", ""], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(1).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::JobEnded(JobState::Gone));
        assert_eq!(report.final_state, JobState::Gone);
        assert!(report.error.is_none());
        assert!(!report.is_success());
        assert_eq!(harness.tunnel_spawns(), 1);
        assert_eq!(supervisor.tunnel_state(), TunnelState::Exited);
        assert!(harness.scheduler.actions().is_empty());

        let queries = harness.scheduler.status_queries.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.scheduler.status_queries.load(Ordering::SeqCst), queries);
    }

    #[tokio::test]
    async fn remote_job_gets_exactly_one_tunnel() {
        let harness = Harness::new(&["1", "2"], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(8).await.unwrap();
        wait_until(|| supervisor.tunnel_state() == TunnelState::Running).await;
        let queries = harness.scheduler.status_queries.load(Ordering::SeqCst);
        wait_until(|| harness.scheduler.status_queries.load(Ordering::SeqCst) >= queries + 3).await;
        assert_eq!(harness.tunnel_spawns(), 1);
        assert_eq!(supervisor.job_state(), JobState::Running);

        supervisor.stop().await;
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::Requested);
        assert_eq!(report.final_state, JobState::Running);
        assert!(report.error.is_none());
        assert_eq!(supervisor.tunnel_state(), TunnelState::Exited);
        assert_eq!(
            harness.scheduler.actions(),
            vec![(JobId::new("4711"), JobAction::Remove)]
        );
    }

    #[tokio::test]
    async fn suspended_and_transferring_jobs_keep_running() {
        let harness = Harness::new(&["1", "2", "7", "6", "7"], "slot1@node7.cluster.org");
        let supervisor = harness.supervisor();
        supervisor.start(1).await.unwrap();

        wait_until(|| harness.scheduler.status_queries.load(Ordering::SeqCst) >= 8).await;
        assert!(supervisor.report().is_none());
        assert_eq!(supervisor.job_state(), JobState::Suspended);

        supervisor.stop().await;
        assert_eq!(supervisor.report().unwrap().cause, StopCause::Requested);
    }

    #[tokio::test]
    async fn tunnel_dying_under_a_running_job_stops_the_launcher() {
        let mut harness = Harness::new(&["2"], "slot1@node9.cluster.org");
        harness.tunnel_script("sleep 0.5; echo 'Connection to node9 closed' >&2; exit 1");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(1).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::TunnelDied);
        match report.error {
            Some(LaunchError::TunnelDied { job_id, .. }) => assert_eq!(job_id, "4711"),
            other => panic!("unexpected error {other:?}"),
        }
        assert_eq!(harness.tunnel_spawns(), 1);
    }

    #[tokio::test]
    async fn tunnel_that_cannot_start_stops_the_launcher() {
        let mut harness = Harness::new(&["1", "2"], "slot1@node9.cluster.org");
        harness.tunnel_script("echo 'Failed to connect to starter' >&2; exit 255");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(1).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::TunnelStartFailed);
        assert!(matches!(report.error, Some(LaunchError::TunnelStartFailed(ref msg)) if msg.contains("Failed to connect")));
        assert_ne!(supervisor.tunnel_state(), TunnelState::Running);
    }

    #[tokio::test]
    async fn failing_queries_count_as_unknown_until_timeout() {
        let harness = Harness::new(&["ERR"], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.start(1).await.unwrap();
        let report = next_report(&mut reports).await;
        assert_eq!(report.cause, StopCause::JobTimedOut);
        assert_eq!(report.final_state, JobState::Unknown);
        assert!(harness.scheduler.status_queries.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn stop_from_inside_a_callback_is_harmless() {
        let harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let calls = Arc::new(AtomicUsize::new(0));

        let reentrant = supervisor.clone();
        let counter = calls.clone();
        supervisor.on_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move { reentrant.stop().await });
        });
        let counter = calls.clone();
        supervisor.on_stop(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        supervisor.start(1).await.unwrap();
        supervisor.stop().await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        // late registrations still hear about the stop, once
        let late = calls.clone();
        supervisor.on_stop(move |report| {
            assert_eq!(report.cause, StopCause::Requested);
            late.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn stop_before_start_still_reports_and_closes_the_launcher() {
        let harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        let supervisor = harness.supervisor();
        let mut reports = collect_reports(&supervisor);

        supervisor.stop().await;
        let report = next_report(&mut reports).await;
        assert_eq!(report.job, None);
        assert_eq!(report.final_state, JobState::Unknown);
        assert_eq!(supervisor.start(1).await.unwrap_err(), LaunchError::AlreadyStarted);
        assert!(harness.scheduler.submissions().is_empty());
    }

    #[tokio::test]
    async fn dropping_the_launcher_cancels_polling() {
        let mut harness = Harness::new(&["1"], "slot1@node9.cluster.org");
        harness.settings.poll.job_timeout = Duration::from_secs(600);
        let supervisor = harness.supervisor();
        supervisor.start(1).await.unwrap();
        wait_until(|| harness.scheduler.status_queries.load(Ordering::SeqCst) >= 2).await;

        drop(supervisor);
        tokio::time::sleep(Duration::from_millis(50)).await;
        let after_drop = harness.scheduler.status_queries.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(harness.scheduler.status_queries.load(Ordering::SeqCst), after_drop);
    }
}

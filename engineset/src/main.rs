// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use time::format_description::well_known::Rfc3339;
use tokio::sync::oneshot;

use engineset::adapters;
use engineset::app::types::StopReport;
use engineset::{EngineLaunchSupervisor, config, logging};

fn print_report(report: &StopReport) {
    let job = report
        .job
        .as_ref()
        .map(|job| job.job_id.to_string())
        .unwrap_or_else(|| "-".to_string());
    match &report.error {
        Some(err) => println!(
            "job={job} state={} cause={} error={} ({err})",
            report.final_state,
            report.cause.as_str(),
            err.code()
        ),
        None => println!(
            "job={job} state={} cause={}",
            report.final_state,
            report.cause.as_str()
        ),
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let parsed = adapters::cli::parse_opts();
    let opts = parsed.opts;
    let config::LoadResult { config, report } = config::load_with_report(
        opts.config,
        config::Overrides {
            profile_dir: opts.profile_dir,
            cluster_id: opts.cluster_id,
            to_send: opts.to_send,
            requirements: opts.requirements,
            environments: opts.environments,
            job_timeout_secs: opts.job_timeout_secs,
            verbose: parsed.verbose_override,
        },
    )
    .context("failed to load configuration")?;
    logging::init(config.verbose);
    report.log();

    let local_fs = Arc::new(adapters::fs::LocalFilesystem::new());
    let condor = Arc::new(adapters::condor::CondorCli::new(
        config.profile_dir.clone(),
        config.condor_bin_dir.clone(),
        local_fs.clone(),
    ));
    let controller = Arc::new(adapters::controller::PidFileProbe::new(
        config.controller_pid_file(),
        local_fs.clone(),
    ));
    let host = Arc::new(match &config.local_hostname {
        Some(name) => adapters::system::SystemHost::pinned(name.as_str()),
        None => adapters::system::SystemHost::new(),
    });
    let clock = Arc::new(adapters::system::SystemClock::new());

    let supervisor = EngineLaunchSupervisor::new(
        config.launch_settings(),
        condor,
        local_fs,
        controller,
        host,
        clock,
    );
    let (stopped_tx, stopped_rx) = oneshot::channel();
    supervisor.on_stop(move |report| {
        let _ = stopped_tx.send(report.clone());
    });

    let interrupt = tokio::spawn({
        let supervisor = supervisor.clone();
        async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::warn!("failed to listen for ctrl-c: {err}");
                return;
            }
            tracing::info!("interrupted; stopping engines");
            supervisor.stop().await;
        }
    });

    let handle = match supervisor.start(opts.engines).await {
        Ok(handle) => handle,
        Err(err) => {
            interrupt.abort();
            if err.is_pre_submission() {
                tracing::error!(code = err.code(), "no engines were submitted: {err}");
            } else {
                tracing::error!(code = err.code(), "failed to start engines: {err}");
            }
            eprintln!("engineset: {err}");
            return Ok(ExitCode::FAILURE);
        }
    };
    tracing::info!(
        job_id = %handle.job_id,
        engines = handle.engines,
        submitted_at = %handle.submitted_at.format(&Rfc3339).unwrap_or_default(),
        "engines submitted; waiting for the job"
    );

    // ctrl-c goes through stop(), which reports to the same callback
    let report = stopped_rx.await.ok();
    interrupt.abort();

    match report {
        Some(report) => {
            print_report(&report);
            Ok(if report.is_success() {
                ExitCode::SUCCESS
            } else {
                ExitCode::FAILURE
            })
        }
        None => Ok(ExitCode::FAILURE),
    }
}

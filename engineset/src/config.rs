// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use anyhow::{Context, Result};
use serde::Deserialize;
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

use crate::app::launcher::LaunchSettings;
use crate::app::services::poller::PollSettings;
use crate::app::services::submit_description::{
    DEFAULT_BATCH_FILE_NAME, DEFAULT_BATCH_TEMPLATE, validate_clause,
};
use crate::app::services::tunnel::{DEFAULT_SSH_TO_JOB_PROGRAM, TunnelCommand};

const APP_DIR_NAME: &str = "engineset";
const CONFIG_FILE_NAME: &str = "engineset.toml";
pub const CONFIG_ENV_VAR: &str = "ENGINESET_CONFIG_PATH";
const DEFAULT_CONTROLLER_WAIT_SECS: u64 = 20;
const DEFAULT_JOB_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_SECS: u64 = 1;
const DEFAULT_RUNNING_POLL_INTERVAL_SECS: u64 = 20;
const DEFAULT_TUNNEL_GRACE_SECS: u64 = 2;
const DEFAULT_TUNNEL_STOP_GRACE_SECS: u64 = 1;

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct FileConfig {
    profile_dir: Option<String>,
    cluster_id: Option<String>,
    exec_cmd: Option<String>,
    to_send: Option<Vec<String>>,
    requirements: Option<String>,
    environments: Option<String>,
    batch_file_name: Option<String>,
    batch_template_path: Option<String>,
    x509_user_proxy: Option<String>,
    condor_bin_dir: Option<String>,
    local_hostname: Option<String>,
    ssh_to_job_program: Option<String>,
    ssh_to_job_args: Option<Vec<String>>,
    controller_pid_file: Option<String>,
    controller_wait_secs: Option<u64>,
    job_timeout_secs: Option<u64>,
    poll_interval_secs: Option<u64>,
    running_poll_interval_secs: Option<u64>,
    tunnel_grace_secs: Option<u64>,
    tunnel_stop_grace_secs: Option<u64>,
    remove_job_on_stop: Option<bool>,
    verbose: Option<bool>,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub profile_dir: PathBuf,
    pub cluster_id: Option<String>,
    pub exec_cmd: Option<String>,
    pub to_send: Vec<PathBuf>,
    pub requirements: String,
    pub environments: String,
    pub batch_file_name: String,
    /// Contents of `batch_template_path`, or the built-in template.
    pub batch_template: String,
    pub batch_template_path: Option<PathBuf>,
    pub x509_user_proxy: Option<String>,
    pub condor_bin_dir: Option<PathBuf>,
    /// Overrides the OS hostname in the same-host check.
    pub local_hostname: Option<String>,
    pub ssh_to_job_program: String,
    pub ssh_to_job_args: Vec<String>,
    pub controller_pid_file: Option<PathBuf>,
    pub controller_wait_secs: u64,
    pub job_timeout_secs: u64,
    pub poll_interval_secs: u64,
    pub running_poll_interval_secs: u64,
    pub tunnel_grace_secs: u64,
    pub tunnel_stop_grace_secs: u64,
    pub remove_job_on_stop: bool,
    pub verbose: bool,
    pub config_path: Option<PathBuf>,
}

impl Config {
    pub fn launch_settings(&self) -> LaunchSettings {
        LaunchSettings {
            profile_dir: self.profile_dir.clone(),
            cluster_id: self.cluster_id.clone(),
            exec_cmd: self.exec_cmd.clone(),
            to_send: self.to_send.clone(),
            requirements: self.requirements.clone(),
            environments: self.environments.clone(),
            x509_user_proxy: self.x509_user_proxy.clone(),
            batch_file_name: self.batch_file_name.clone(),
            batch_template: self.batch_template.clone(),
            controller_wait: Duration::from_secs(self.controller_wait_secs),
            poll: PollSettings {
                interval: Duration::from_secs(self.poll_interval_secs),
                running_interval: Duration::from_secs(self.running_poll_interval_secs),
                job_timeout: Duration::from_secs(self.job_timeout_secs),
            },
            tunnel_grace: Duration::from_secs(self.tunnel_grace_secs),
            tunnel_stop_grace: Duration::from_secs(self.tunnel_stop_grace_secs),
            tunnel_command: TunnelCommand {
                program: self.ssh_to_job_program.clone(),
                leading_args: self.ssh_to_job_args.clone(),
            },
            remove_job_on_stop: self.remove_job_on_stop,
        }
    }

    /// The configured pid file, or the one the controller writes into the profile.
    pub fn controller_pid_file(&self) -> PathBuf {
        match &self.controller_pid_file {
            Some(path) => path.clone(),
            None => self.launch_settings().controller_pid_file(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigSource {
    Override,
    Env,
    ConfigFile,
    Default,
}

impl ConfigSource {
    pub fn as_str(self) -> &'static str {
        match self {
            ConfigSource::Override => "override",
            ConfigSource::Env => "env",
            ConfigSource::ConfigFile => "config",
            ConfigSource::Default => "default",
        }
    }
}

#[derive(Debug)]
pub struct ConfigValue<T> {
    pub value: T,
    pub source: ConfigSource,
}

#[derive(Debug)]
pub struct ConfigReport {
    pub config_path: Option<PathBuf>,
    pub config_path_source: Option<ConfigSource>,
    pub config_file_present: bool,
    pub profile_dir: ConfigValue<PathBuf>,
    pub cluster_id: ConfigValue<Option<String>>,
    pub requirements: ConfigValue<String>,
    pub environments: ConfigValue<String>,
    pub job_timeout_secs: ConfigValue<u64>,
    pub verbose: ConfigValue<bool>,
}

impl ConfigReport {
    pub fn log(&self) {
        match (&self.config_path, self.config_path_source) {
            (Some(path), Some(source)) => tracing::info!(
                path = %path.display(),
                source = source.as_str(),
                present = self.config_file_present,
                "config path"
            ),
            (Some(path), None) => tracing::info!(
                path = %path.display(),
                present = self.config_file_present,
                "config path"
            ),
            (None, _) => tracing::info!("config path: (none)"),
        }
        tracing::info!(
            value = %self.profile_dir.value.display(),
            source = self.profile_dir.source.as_str(),
            "config profile_dir"
        );
        tracing::info!(
            value = self.cluster_id.value.as_deref().unwrap_or(""),
            source = self.cluster_id.source.as_str(),
            "config cluster_id"
        );
        tracing::info!(
            value = %self.requirements.value,
            source = self.requirements.source.as_str(),
            "config requirements"
        );
        tracing::info!(
            value = %self.environments.value,
            source = self.environments.source.as_str(),
            "config environments"
        );
        tracing::info!(
            value = self.job_timeout_secs.value,
            source = self.job_timeout_secs.source.as_str(),
            "config job_timeout_secs"
        );
        tracing::info!(
            value = self.verbose.value,
            source = self.verbose.source.as_str(),
            "config verbose"
        );
    }
}

#[derive(Debug)]
pub struct LoadResult {
    pub config: Config,
    pub report: ConfigReport,
}

#[derive(Debug, Default)]
pub struct Overrides {
    pub profile_dir: Option<PathBuf>,
    pub cluster_id: Option<String>,
    /// Replaces the configured list when non-empty.
    pub to_send: Vec<PathBuf>,
    pub requirements: Option<String>,
    pub environments: Option<String>,
    pub job_timeout_secs: Option<u64>,
    pub verbose: Option<bool>,
}

fn pick<T>(over: Option<T>, file: Option<T>, default: impl FnOnce() -> T) -> (T, ConfigSource) {
    match (over, file) {
        (Some(value), _) => (value, ConfigSource::Override),
        (None, Some(value)) => (value, ConfigSource::ConfigFile),
        (None, None) => (default(), ConfigSource::Default),
    }
}

pub fn load(config_path_override: Option<PathBuf>, overrides: Overrides) -> Result<Config> {
    Ok(load_with_report(config_path_override, overrides)?.config)
}

pub fn load_with_report(
    config_path_override: Option<PathBuf>,
    overrides: Overrides,
) -> Result<LoadResult> {
    let (config_path, config_path_source, required) = match config_path_override {
        Some(path) => (Some(expand_path(path)), Some(ConfigSource::Override), true),
        None => match config_path_from_env()? {
            Some(path) => (Some(expand_path(path)), Some(ConfigSource::Env), true),
            None => match default_config_path().ok() {
                Some(path) => (Some(path), Some(ConfigSource::Default), false),
                None => (None, None, false),
            },
        },
    };
    let config_file_present = config_path
        .as_deref()
        .map(|path| path.exists())
        .unwrap_or(false);

    let file = match config_path.as_deref() {
        Some(path) => read_config_file(path, required)?,
        None => FileConfig::default(),
    };
    let base_dir = config_path.as_deref().and_then(|path| path.parent());
    let from_file = |raw: Option<String>| raw.map(|raw| resolve_path(&raw, base_dir));

    let profile_dir_file = from_file(file.profile_dir);
    let (profile_dir, profile_dir_source) = match overrides.profile_dir {
        Some(path) => (expand_path(path), ConfigSource::Override),
        None => match profile_dir_file {
            Some(path) => (path, ConfigSource::ConfigFile),
            None => (
                default_profile_dir().with_context(|| {
                    "failed to resolve default IPython profile; specify --profile-dir or set profile_dir in the config file"
                })?,
                ConfigSource::Default,
            ),
        },
    };

    let (cluster_id, cluster_id_source) = pick(
        overrides.cluster_id.map(Some),
        file.cluster_id.map(Some),
        || None,
    );
    let cluster_id = cluster_id.filter(|id| !id.trim().is_empty());

    let (requirements, requirements_source) =
        pick(overrides.requirements, file.requirements, String::new);
    validate_clause("requirements", &requirements)
        .with_context(|| "invalid requirements")?;
    let (environments, environments_source) =
        pick(overrides.environments, file.environments, String::new);
    validate_clause("environments", &environments)
        .with_context(|| "invalid environments")?;

    let to_send = if overrides.to_send.is_empty() {
        file.to_send
            .unwrap_or_default()
            .iter()
            .map(|raw| resolve_path(raw, base_dir))
            .collect()
    } else {
        overrides.to_send.into_iter().map(expand_path).collect()
    };

    let batch_template_path = from_file(file.batch_template_path);
    let batch_template = match &batch_template_path {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("failed to read batch template {}", path.display()))?,
        None => DEFAULT_BATCH_TEMPLATE.to_string(),
    };

    let (job_timeout_secs, job_timeout_source) = pick(
        overrides.job_timeout_secs,
        file.job_timeout_secs,
        || DEFAULT_JOB_TIMEOUT_SECS,
    );
    let poll_interval_secs = file.poll_interval_secs.unwrap_or(DEFAULT_POLL_INTERVAL_SECS);
    let running_poll_interval_secs = file
        .running_poll_interval_secs
        .unwrap_or(DEFAULT_RUNNING_POLL_INTERVAL_SECS);
    if poll_interval_secs == 0 || running_poll_interval_secs == 0 {
        anyhow::bail!("poll intervals must be at least one second");
    }
    let (verbose, verbose_source) = pick(overrides.verbose, file.verbose, || false);

    let config = Config {
        profile_dir,
        cluster_id,
        exec_cmd: file.exec_cmd,
        to_send,
        requirements,
        environments,
        batch_file_name: file
            .batch_file_name
            .unwrap_or_else(|| DEFAULT_BATCH_FILE_NAME.to_string()),
        batch_template,
        batch_template_path,
        x509_user_proxy: file.x509_user_proxy,
        condor_bin_dir: from_file(file.condor_bin_dir),
        local_hostname: file.local_hostname,
        ssh_to_job_program: file
            .ssh_to_job_program
            .unwrap_or_else(|| DEFAULT_SSH_TO_JOB_PROGRAM.to_string()),
        ssh_to_job_args: file.ssh_to_job_args.unwrap_or_default(),
        controller_pid_file: from_file(file.controller_pid_file),
        controller_wait_secs: file
            .controller_wait_secs
            .unwrap_or(DEFAULT_CONTROLLER_WAIT_SECS),
        job_timeout_secs,
        poll_interval_secs,
        running_poll_interval_secs,
        tunnel_grace_secs: file.tunnel_grace_secs.unwrap_or(DEFAULT_TUNNEL_GRACE_SECS),
        tunnel_stop_grace_secs: file
            .tunnel_stop_grace_secs
            .unwrap_or(DEFAULT_TUNNEL_STOP_GRACE_SECS),
        remove_job_on_stop: file.remove_job_on_stop.unwrap_or(true),
        verbose,
        config_path: config_path.clone(),
    };

    let report = ConfigReport {
        config_path,
        config_path_source,
        config_file_present,
        profile_dir: ConfigValue {
            value: config.profile_dir.clone(),
            source: profile_dir_source,
        },
        cluster_id: ConfigValue {
            value: config.cluster_id.clone(),
            source: cluster_id_source,
        },
        requirements: ConfigValue {
            value: config.requirements.clone(),
            source: requirements_source,
        },
        environments: ConfigValue {
            value: config.environments.clone(),
            source: environments_source,
        },
        job_timeout_secs: ConfigValue {
            value: config.job_timeout_secs,
            source: job_timeout_source,
        },
        verbose: ConfigValue {
            value: config.verbose,
            source: verbose_source,
        },
    };

    Ok(LoadResult { config, report })
}

fn read_config_file(path: &Path, required: bool) -> Result<FileConfig> {
    if !path.exists() {
        if required {
            anyhow::bail!("config file not found at {}", path.display());
        }
        return Ok(FileConfig::default());
    }

    let contents = fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file {}", path.display()))
}

fn resolve_path(raw: &str, base_dir: Option<&Path>) -> PathBuf {
    let expanded = shellexpand::tilde(raw);
    let path = PathBuf::from(expanded.as_ref());
    if path.is_absolute() {
        return path;
    }
    match base_dir {
        Some(dir) => dir.join(path),
        None => path,
    }
}

fn expand_path(path: PathBuf) -> PathBuf {
    let path_string = path.to_string_lossy().to_string();
    let expanded = shellexpand::tilde(&path_string);
    PathBuf::from(expanded.as_ref())
}

fn config_path_from_env() -> Result<Option<PathBuf>> {
    match std::env::var_os(CONFIG_ENV_VAR) {
        Some(value) => {
            if value.is_empty() {
                anyhow::bail!("{CONFIG_ENV_VAR} is set but empty");
            }
            Ok(Some(PathBuf::from(value)))
        }
        None => Ok(None),
    }
}

fn default_config_path() -> Result<PathBuf> {
    let base = dirs::config_dir().context("failed to resolve config directory")?;
    Ok(base.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
}

fn default_profile_dir() -> Result<PathBuf> {
    let home = dirs::home_dir().context("failed to resolve home directory")?;
    Ok(home.join(".ipython").join("profile_default"))
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

//! Launches ipyparallel engines as an HTCondor batch job and keeps a
//! `condor_ssh_to_job` reverse tunnel open to the local controller while the
//! job runs.

pub mod adapters;
pub mod app;
pub mod config;
pub mod logging;

pub use app::launcher::{EngineLaunchSupervisor, LaunchSettings};

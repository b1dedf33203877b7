// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod clock;
pub mod controller;
pub mod host;
pub mod local_fs;
pub mod scheduler;

pub use clock::ClockPort;
pub use controller::ControllerProbePort;
pub use host::LocalHostPort;
pub use local_fs::LocalFilesystemPort;
pub use scheduler::SchedulerPort;

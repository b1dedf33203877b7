// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod cli;
pub mod condor;
pub mod controller;
pub mod fs;
pub mod system;

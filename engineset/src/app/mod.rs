// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod errors;
pub mod launcher;
pub mod ports;
pub mod services;
pub mod types;

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

pub mod hostname;
pub mod pipe_reader;
pub mod poller;
pub mod readiness;
pub mod submit_description;
pub mod tunnel;

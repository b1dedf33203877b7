// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

/// Identity of the machine the launcher runs on.
pub trait LocalHostPort: Send + Sync {
    /// Host name as compared against a job's `RemoteHost`. May be unqualified.
    fn hostname(&self) -> String;
}

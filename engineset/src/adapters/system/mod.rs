// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use time::OffsetDateTime;

use crate::app::ports::{ClockPort, LocalHostPort};

/// Hostname of this machine as reported by the OS, unless pinned.
///
/// `gethostname` is often the short name. Sites where short names are
/// ambiguous across domains should pin the qualified name.
#[derive(Clone, Default)]
pub struct SystemHost {
    pinned: Option<String>,
}

impl SystemHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pinned(name: impl Into<String>) -> Self {
        Self {
            pinned: Some(name.into()),
        }
    }
}

impl LocalHostPort for SystemHost {
    fn hostname(&self) -> String {
        match self.pinned.as_deref().map(str::trim).filter(|name| !name.is_empty()) {
            Some(name) => name.to_string(),
            None => gethostname::gethostname().to_string_lossy().into_owned(),
        }
    }
}

#[derive(Clone, Default)]
pub struct SystemClock;

impl SystemClock {
    pub fn new() -> Self {
        Self
    }
}

impl ClockPort for SystemClock {
    fn now_utc(&self) -> OffsetDateTime {
        OffsetDateTime::now_utc()
    }
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

#[async_trait]
/// Liveness of the local ipcontroller the engines will connect back to.
pub trait ControllerProbePort: Send + Sync {
    async fn is_ready(&self) -> bool;

    /// Human-readable description of what is being probed (usually the pid file).
    fn location(&self) -> String;
}

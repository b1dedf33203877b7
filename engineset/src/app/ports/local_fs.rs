// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::LaunchResult;

#[async_trait]
pub trait LocalFilesystemPort: Send + Sync {
    async fn exists(&self, path: &Path) -> bool;
    async fn read_to_string(&self, path: &Path) -> LaunchResult<String>;
    /// Creates missing parent directories and replaces any existing file.
    async fn write(&self, path: &Path, contents: &str) -> LaunchResult<()>;
}

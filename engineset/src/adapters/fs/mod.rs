// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::path::Path;

use async_trait::async_trait;

use crate::app::errors::{LaunchResult, local_error};
use crate::app::ports::LocalFilesystemPort;

#[derive(Clone, Default)]
pub struct LocalFilesystem;

impl LocalFilesystem {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl LocalFilesystemPort for LocalFilesystem {
    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "exists", path = %path.display()))]
    async fn exists(&self, path: &Path) -> bool {
        tokio::fs::try_exists(path).await.unwrap_or(false)
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self, path), fields(op = "read_to_string", path = %path.display()))]
    async fn read_to_string(&self, path: &Path) -> LaunchResult<String> {
        tokio::fs::read_to_string(path)
            .await
            .map_err(|err| local_error(format!("failed to read {}: {err}", path.display())))
    }

    #[tracing::instrument(name = "fs", level = "debug", skip(self, path, contents), fields(op = "write", path = %path.display()))]
    async fn write(&self, path: &Path, contents: &str) -> LaunchResult<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|err| {
                local_error(format!("failed to create {}: {err}", parent.display()))
            })?;
        }
        tokio::fs::write(path, contents)
            .await
            .map_err(|err| local_error(format!("failed to write {}: {err}", path.display())))
    }
}

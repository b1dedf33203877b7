// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use async_trait::async_trait;

use crate::app::errors::LaunchResult;
use crate::app::types::{JobAction, JobId, SubmitDescription};

#[async_trait]
/// Batch scheduler boundary (HTCondor in production).
/// Held as `Arc<dyn SchedulerPort>` by the supervisor and its poller task.
pub trait SchedulerPort: Send + Sync {
    async fn submit(&self, description: &SubmitDescription) -> LaunchResult<JobId>;

    async fn query_attribute(&self, job_id: &JobId, attribute: &str) -> LaunchResult<String>;

    async fn act(&self, job_id: &JobId, action: JobAction) -> LaunchResult<()>;
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;
use tracing::Instrument;

const DEFAULT_BUFFER_LINES: usize = 200;

pub type LineSink = Box<dyn FnMut(String) + Send + 'static>;

/// Bounded line buffer shared between a reader task and its owner.
#[derive(Clone, Debug)]
pub struct LineBuffer {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl Default for LineBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_BUFFER_LINES)
    }
}

impl LineBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::new())),
            capacity: capacity.max(1),
        }
    }

    pub fn push(&self, line: String) {
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == self.capacity {
            lines.pop_front();
        }
        lines.push_back(line);
    }

    pub fn snapshot(&self) -> Vec<String> {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        lines.iter().cloned().collect()
    }

    /// Last few lines joined for error messages.
    pub fn tail(&self, count: usize) -> String {
        let lines = self.snapshot();
        let start = lines.len().saturating_sub(count);
        lines[start..].join("\n")
    }
}

/// Drains one output stream of a child process, line by line, on its own task.
///
/// Reads are readiness-driven; the task detaches itself when the stream
/// reports end-of-file, which happens once the child (and anything that
/// inherited the pipe) has exited.
pub struct PipeReader {
    task: JoinHandle<usize>,
}

impl PipeReader {
    /// Hands every line to `sink` as soon as it is complete.
    pub fn spawn<R>(stream: R, sink: LineSink, span: tracing::Span) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        Self {
            task: spawn_reader(stream, sink, span),
        }
    }

    /// Waits for end-of-stream and returns how many lines were delivered.
    pub async fn join(self) -> usize {
        self.task.await.unwrap_or(0)
    }
}

fn spawn_reader<R>(stream: R, mut sink: LineSink, span: tracing::Span) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(
        async move {
            let mut lines = BufReader::new(stream).lines();
            let mut delivered = 0usize;
            loop {
                match lines.next_line().await {
                    Ok(Some(line)) => {
                        delivered += 1;
                        sink(line);
                    }
                    Ok(None) => {
                        tracing::debug!(lines = delivered, "stream closed");
                        break;
                    }
                    Err(err) => {
                        tracing::debug!("stream read failed: {err}");
                        break;
                    }
                }
            }
            delivered
        }
        .instrument(span),
    )
}

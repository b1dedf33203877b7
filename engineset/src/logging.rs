// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use std::env;
use std::path::Path;
use std::sync::OnceLock;

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::{EnvFilter, Registry};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const LOG_ENV: &str = "ENGINESET_LOG";
pub const LOG_FORMAT_ENV: &str = "ENGINESET_LOG_FORMAT";
pub const LOG_SPAN_EVENTS_ENV: &str = "ENGINESET_LOG_SPAN_EVENTS";
pub const LOG_FILE_ENV: &str = "ENGINESET_LOG_FILE";

static FILE_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

#[derive(Copy, Clone, Debug, PartialEq, Eq)]
enum LogFormat {
    Json,
    Pretty,
    Compact,
}

/// Installs the global subscriber. Console output goes to stderr so stdout
/// stays free for the stop report.
pub fn init(verbose: bool) {
    let filter = build_filter(env::var(LOG_ENV).ok().as_deref(), verbose);
    let span_events = parse_span_events(env::var(LOG_SPAN_EVENTS_ENV).ok().as_deref());
    let format = parse_format(env::var(LOG_FORMAT_ENV).ok().as_deref());
    let registry = Registry::default()
        .with(filter)
        .with(tracing_error::ErrorLayer::default());
    let file_writer = build_file_writer();

    macro_rules! install {
        ($style:ident) => {{
            let console_layer = tracing_subscriber::fmt::layer()
                .$style()
                .with_writer(std::io::stderr)
                .with_timer(UtcTime::rfc_3339())
                .with_span_events(span_events.clone());
            match file_writer {
                Some((writer, guard)) => {
                    let file_layer = tracing_subscriber::fmt::layer()
                        .$style()
                        .with_ansi(false)
                        .with_timer(UtcTime::rfc_3339())
                        .with_span_events(span_events)
                        .with_writer(writer);
                    registry.with(console_layer).with(file_layer).init();
                    let _ = FILE_GUARD.set(guard);
                }
                None => registry.with(console_layer).init(),
            }
        }};
    }

    match format {
        LogFormat::Json => install!(json),
        LogFormat::Pretty => install!(pretty),
        LogFormat::Compact => install!(compact),
    }
}

fn build_filter(directives: Option<&str>, verbose: bool) -> EnvFilter {
    match directives.map(str::trim).filter(|value| !value.is_empty()) {
        Some(value) => EnvFilter::new(value),
        None if verbose => EnvFilter::new("debug"),
        None => EnvFilter::new("info"),
    }
}

fn normalized(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_ascii_lowercase())
}

fn parse_format(value: Option<&str>) -> LogFormat {
    match normalized(value).as_deref() {
        Some("json") => LogFormat::Json,
        Some("pretty") => LogFormat::Pretty,
        _ => LogFormat::Compact,
    }
}

/// Accepts a comma-separated list such as `new,close`.
fn parse_span_events(value: Option<&str>) -> FmtSpan {
    let Some(value) = normalized(value) else {
        return FmtSpan::NONE;
    };
    value
        .split(',')
        .map(str::trim)
        .fold(FmtSpan::NONE, |events, item| match item {
            "new" => events | FmtSpan::NEW,
            "enter" => events | FmtSpan::ENTER,
            "exit" => events | FmtSpan::EXIT,
            "close" => events | FmtSpan::CLOSE,
            "active" => events | FmtSpan::ACTIVE,
            "full" => events | FmtSpan::FULL,
            _ => events,
        })
}

fn build_file_writer() -> Option<(NonBlocking, WorkerGuard)> {
    let file_path = env::var(LOG_FILE_ENV)
        .ok()
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())?;

    let path = Path::new(&file_path);
    let file_name = path.file_name()?.to_string_lossy().to_string();
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let appender = tracing_appender::rolling::never(dir, file_name);
    Some(tracing_appender::non_blocking(appender))
}

// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

use tera::Context;

use crate::app::errors::{LaunchError, LaunchResult};
use crate::app::types::{SubmitContext, SubmitDescription};

pub const DEFAULT_BATCH_FILE_NAME: &str = "htcondor_engines.job";

/// Vanilla-universe description starting `n` MPI engines through the launcher script.
pub const DEFAULT_BATCH_TEMPLATE: &str = r#"
universe             = vanilla
executable           = {{ exec_cmd }}
transfer_executable  = true
transfer_input_files = {{ to_send }}
should_transfer_files= yes

stream_output = true
stream_error  = true
output = ipyengine.$(ClusterId).$(ProcId).out.txt
error  = ipyengine.$(ClusterId).$(ProcId).err.txt
log    = ipyengine.$(ClusterId).$(ProcId).log

arguments = "mpiexec --n {{ n }} ipengine --file={{ name_pre }}-engine.json --cluster-id={{ cluster_id }} --mpi --timeout=30 "

{{ requirements }}
{{ environments }}
{{ proxy }}
+ipengine_starter_n={{ n }}

queue
"#;

/// Accepts an empty clause or one that starts with `identifier =`.
///
/// Only the prefix is checked; the scheduler validates the rest of the expression.
pub fn is_valid_clause(value: &str) -> bool {
    if value.is_empty() {
        return true;
    }
    let rest = value.trim_start();
    let ident_len: usize = rest
        .chars()
        .take_while(|c| c.is_alphanumeric() || *c == '_')
        .map(char::len_utf8)
        .sum();
    if ident_len == 0 {
        return false;
    }
    rest[ident_len..].trim_start().starts_with('=')
}

pub fn validate_clause(field: &'static str, value: &str) -> LaunchResult<()> {
    if is_valid_clause(value) {
        Ok(())
    } else {
        Err(LaunchError::InvalidRequirementSyntax {
            field,
            value: value.to_string(),
        })
    }
}

/// `x509UserProxy=<path>` when a proxy is configured, empty otherwise.
pub fn proxy_clause(proxy: Option<&str>) -> String {
    match proxy.map(str::trim).filter(|p| !p.is_empty()) {
        Some(path) => format!("x509UserProxy={path}"),
        None => String::new(),
    }
}

pub fn render(
    template: &str,
    file_name: &str,
    context: &SubmitContext,
) -> LaunchResult<SubmitDescription> {
    validate_clause("requirements", &context.requirements)?;
    validate_clause("environments", &context.environments)?;

    let to_send = context
        .to_send
        .iter()
        .map(|path| path.to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(",");

    let mut ctx = Context::new();
    ctx.insert("exec_cmd", &context.exec_cmd);
    ctx.insert("to_send", &to_send);
    ctx.insert("n", &context.engines);
    ctx.insert("name_pre", &context.name_pre);
    ctx.insert("cluster_id", &context.cluster_id);
    ctx.insert("requirements", &context.requirements);
    ctx.insert("environments", &context.environments);
    ctx.insert("proxy", &context.proxy);

    let body = tera::Tera::one_off(template, &ctx, false)
        .map_err(|err| LaunchError::Submission(format!("failed to render submit template: {err}")))?;

    Ok(SubmitDescription {
        file_name: file_name.to_string(),
        body,
        engines: context.engines,
    })
}

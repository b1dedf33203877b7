// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

/// Extracts the machine from a `RemoteHost` attribute such as `slot1_2@node7.cluster.org`.
pub fn remote_machine(remote_host: &str) -> Option<&str> {
    let trimmed = remote_host.trim();
    let machine = match trimmed.split_once('@') {
        Some((_slot, machine)) => machine,
        None => trimmed,
    };
    let machine = machine.trim();
    if machine.is_empty() {
        None
    } else {
        Some(machine)
    }
}

fn canonical(name: &str) -> String {
    name.trim().trim_end_matches('.').to_ascii_lowercase()
}

/// Whether `remote` names the same machine as `local`.
///
/// Names are compared case-insensitively and without a trailing root dot.
/// When exactly one side is unqualified, only the first labels are compared:
/// a local `node7` matches `node7.a.org` and `node7.b.org` alike. Pin the
/// qualified local name (`local_hostname`) where that is ambiguous.
pub fn is_same_host(remote: &str, local: &str) -> bool {
    let remote = canonical(remote);
    let local = canonical(local);
    if remote.is_empty() || local.is_empty() {
        return false;
    }
    if remote == local {
        return true;
    }
    let remote_qualified = remote.contains('.');
    let local_qualified = local.contains('.');
    if remote_qualified == local_qualified {
        return false;
    }
    let first_label = |name: &str| name.split('.').next().unwrap_or_default().to_string();
    first_label(&remote) == first_label(&local)
}

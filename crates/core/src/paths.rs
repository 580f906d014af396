// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Host-path normalization.
//!
//! Users paste paths from whatever terminal they have open; on a POSIX host
//! that may be a Windows drive path or a `\\wsl$` UNC path. Normalization is
//! best-effort: anything unrecognized is returned untouched, never an error.

/// Normalize a user-supplied path into the form the local filesystem expects.
///
/// On Windows hosts input is kept verbatim. Elsewhere, `X:\a\b` becomes
/// `/mnt/x/a/b` and `\\wsl$\<distro>\p` becomes `/p`.
pub fn normalize_host_path(input: &str) -> String {
    normalize_host_path_for(input, cfg!(windows))
}

pub(crate) fn normalize_host_path_for(input: &str, host_is_windows: bool) -> String {
    if host_is_windows {
        return input.to_string();
    }

    if let Some(rest) = strip_wsl_unc(input) {
        return rest;
    }

    if let Some(mapped) = map_drive_path(input) {
        return mapped;
    }

    input.to_string()
}

/// Convert a Windows path to its Linux sub-environment form, for commands
/// dispatched through the bridge. POSIX paths pass through.
pub fn to_linux_subenv_path(input: &str) -> String {
    if let Some(rest) = strip_wsl_unc(input) {
        return rest;
    }
    if let Some(mapped) = map_drive_path(input) {
        return mapped;
    }
    input.to_string()
}

/// `\\wsl$\<distro>\p\q` → `/p/q`
fn strip_wsl_unc(input: &str) -> Option<String> {
    let rest = input
        .strip_prefix("\\\\wsl$\\")
        .or_else(|| input.strip_prefix("\\\\wsl.localhost\\"))?;
    let mut parts = rest.splitn(2, '\\');
    let _distro = parts.next()?;
    let path = parts.next().unwrap_or("");
    Some(format!("/{}", path.replace('\\', "/")))
}

/// `X:\a\b` or `X:/a/b` → `/mnt/x/a/b`
fn map_drive_path(input: &str) -> Option<String> {
    let mut chars = input.chars();
    let drive = chars.next()?;
    if !drive.is_ascii_alphabetic() || chars.next() != Some(':') {
        return None;
    }
    let rest: String = chars.collect();
    if !rest.is_empty() && !rest.starts_with('\\') && !rest.starts_with('/') {
        return None;
    }
    let tail = rest.replace('\\', "/");
    let tail = tail.trim_start_matches('/');
    if tail.is_empty() {
        Some(format!("/mnt/{}", drive.to_ascii_lowercase()))
    } else {
        Some(format!("/mnt/{}/{}", drive.to_ascii_lowercase(), tail))
    }
}

#[cfg(test)]
#[path = "paths_tests.rs"]
mod tests;

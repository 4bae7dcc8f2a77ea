// Copyright (c) 2023 University of New Hampshire
// SPDX-License-Identifier: MIT

//! Manager version and the MAJOR.MINOR compatibility gate applied to
//! runner registrations.

pub const MANAGER_VERSION: &str = "0.9.0";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid version format: {0:?}")]
pub struct VersionParseError(pub String);

/// Extract `(major, minor)` from a semver-ish string.
///
/// Accepts values like `0.9.0`, `0.9`, `v0.9.1`, `0.9.0-alpha+1`.
pub fn parse_major_minor(version: &str) -> Result<(u32, u32), VersionParseError> {
    let candidate = version.trim();
    let candidate = candidate.strip_prefix('v').unwrap_or(candidate);

    let mut parts = candidate.split('.');
    let major = parts
        .next()
        .and_then(parse_version_component)
        .ok_or_else(|| VersionParseError(version.to_string()))?;
    let minor = parts
        .next()
        .and_then(parse_version_component)
        .ok_or_else(|| VersionParseError(version.to_string()))?;

    Ok((major, minor))
}

/// A component is a bare decimal number, optionally trailed by pre-release or
/// build metadata (`0-alpha`, `0+1`).
fn parse_version_component(part: &str) -> Option<u32> {
    let numeric: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
    if numeric.is_empty() {
        return None;
    }
    // Reject leading zeros on multi-digit components, matching strict semver.
    if numeric.len() > 1 && numeric.starts_with('0') {
        return None;
    }
    numeric.parse().ok()
}

/// `(major, minor, patch)` of the manager itself.
pub fn version_info() -> (u32, u32, u32) {
    let mut parts = MANAGER_VERSION.split('.');
    let mut next = || {
        parts
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or_default()
    };
    (next(), next(), next())
}

/// True when a runner at `runner_version` may register with this manager:
/// MAJOR and MINOR must agree, PATCH is free.
pub fn versions_compatible(runner_version: &str) -> Result<bool, VersionParseError> {
    let runner = parse_major_minor(runner_version)?;
    let manager =
        parse_major_minor(MANAGER_VERSION).expect("MANAGER_VERSION is a valid version string");
    Ok(runner == manager)
}

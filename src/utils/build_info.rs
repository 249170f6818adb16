//! Build metadata reported by `GET /version`.
//!
//! Values come from `BUILD_VERSION`, `BUILD_COMMIT`, `BUILD_BRANCH` and
//! `BUILD_TIME` (RFC 3339), then a `build.info` file of `key=value` lines
//! overrides whatever it sets.
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Locations probed for a `build.info` file, first hit wins.
pub const BUILD_INFO_PATHS: [&str; 3] = ["build.info", "../build.info", "/app/build.info"];

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct BuildInfo {
    pub version: String,
    pub git_commit: String,
    pub git_branch: String,
    pub build_time: Option<DateTime<Utc>>,
    pub rust_version: Option<String>,
    pub os: String,
    pub arch: String,
}

impl Default for BuildInfo {
    fn default() -> Self {
        Self {
            version: "dev".to_string(),
            git_commit: "unknown".to_string(),
            git_branch: "unknown".to_string(),
            build_time: None,
            rust_version: option_env!("CARGO_PKG_RUST_VERSION")
                .filter(|v| !v.is_empty())
                .map(str::to_string),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

impl BuildInfo {
    /// Environment first, then the first `build.info` found.
    pub fn discover() -> Self {
        let mut info = Self::from_env();
        for path in BUILD_INFO_PATHS {
            if let Ok(content) = std::fs::read_to_string(Path::new(path)) {
                info.apply_file(&content);
                break;
            }
        }
        info
    }

    pub fn from_env() -> Self {
        let mut info = Self::default();
        if let Some(v) = env_non_empty("BUILD_VERSION") {
            info.version = v;
        }
        if let Some(v) = env_non_empty("BUILD_COMMIT") {
            info.git_commit = v;
        }
        if let Some(v) = env_non_empty("BUILD_BRANCH") {
            info.git_branch = v;
        }
        if let Some(v) = env_non_empty("BUILD_TIME") {
            info.build_time = parse_time(&v);
        }
        info
    }

    /// Overlay values from `build.info` content. Blank lines and `#` comments are skipped.
    pub fn apply_file(&mut self, content: &str) {
        for line in content.lines().map(str::trim) {
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let value = value.trim();
            if value.is_empty() {
                continue;
            }
            match key.trim().to_ascii_lowercase().as_str() {
                "version" => self.version = value.to_string(),
                "commit" | "git_commit" => self.git_commit = value.to_string(),
                "branch" | "git_branch" => self.git_branch = value.to_string(),
                "build_time" => {
                    if let Some(time) = parse_time(value) {
                        self.build_time = Some(time);
                    }
                }
                _ => {}
            }
        }
    }

    /// `"{version}-{commit[..7]} ({YYYY-MM-DD})"`.
    pub fn summary(&self) -> String {
        let commit: String = self.git_commit.chars().take(7).collect();
        let date = self
            .build_time
            .map(|t| t.format("%Y-%m-%d").to_string())
            .unwrap_or_else(|| "unknown".to_string());
        format!("{}-{} ({})", self.version, commit, date)
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.is_empty())
}

fn parse_time(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|t| t.with_timezone(&Utc))
}

//! Stakenode Logging
//!
//! One place to install the process-wide `tracing` subscriber.
//! `RUST_LOG` overrides the configured level when it is set and valid.

use serde::{Deserialize, Serialize};
use tracing_subscriber::EnvFilter;

const WORKSPACE_TARGETS: &[&str] = &[
    "stakenode_core",
    "stakenode_logging",
    "stakenode_settings",
    "stakenode_tasks",
    "stakenode_minipool",
    "stakenode_watchtower",
    "stakenode_app",
];

/// Verbosity requested by configuration or the command line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    /// `Debug` when verbose, the default otherwise.
    pub fn from_verbose(verbose: bool) -> Self {
        if verbose {
            Self::Debug
        } else {
            Self::Info
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    /// Directive string for the default filter: this workspace's crates at
    /// `self`, everything else at `warn`.
    pub fn directives(&self) -> String {
        let mut out = String::from("warn");
        for target in WORKSPACE_TARGETS {
            out.push_str(&format!(",{}={}", target, self.as_str()));
        }
        out
    }
}

/// Build the filter: `RUST_LOG` if usable, otherwise `level`.
pub fn env_filter(level: LogLevel) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.directives()))
}

/// Install the global subscriber. Returns `false` if one was already set.
pub fn try_init(level: LogLevel) -> bool {
    let installed = tracing_subscriber::fmt()
        .with_env_filter(env_filter(level))
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok();
    if installed {
        tracing::debug!(level = level.as_str(), "logging initialised");
    }
    installed
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_verbose() {
        assert_eq!(LogLevel::from_verbose(true), LogLevel::Debug);
        assert_eq!(LogLevel::from_verbose(false), LogLevel::Info);
    }

    #[test]
    fn test_directives_scope_workspace_crates() {
        let d = LogLevel::Trace.directives();
        assert!(d.starts_with("warn,"));
        assert!(d.contains("stakenode_minipool=trace"));
        assert!(d.contains("stakenode_tasks=trace"));
        assert!(d.contains("stakenode_logging=trace"));
    }

    #[test]
    fn test_serde_lowercase() {
        let json = serde_json::to_string(&LogLevel::Debug).unwrap();
        assert_eq!(json, "\"debug\"");
        let parsed: LogLevel = serde_json::from_str("\"error\"").unwrap();
        assert_eq!(parsed, LogLevel::Error);
    }

    #[test]
    fn test_second_init_is_harmless() {
        let _ = try_init(LogLevel::Info);
        assert!(!try_init(LogLevel::Debug));
    }
}

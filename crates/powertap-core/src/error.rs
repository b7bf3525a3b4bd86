//! Session-level error taxonomy.
//!
//! Only conditions that affect a whole monitoring session surface here.
//! Per-sample problems (an unparseable line, a missing rail, an anchor pair
//! that produces an impossible fraction, a buffer overflow) are absorbed at
//! the layer that sees them and never become a [`PowerError`].

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Errors that end or prevent a monitoring session.
#[derive(Error, Debug)]
pub enum PowerError {
    /// The sampling binary is not installed or not on `PATH`.
    #[error("`{program}` was not found")]
    BinaryMissing { program: String },

    /// The sampling binary needs privileges this process does not have.
    #[error("`{program}` requires elevated privileges")]
    PermissionDenied { program: String },

    /// Spawning failed for a reason other than a missing binary or privileges.
    #[error("failed to spawn `{program}`: {source}")]
    Spawn {
        program: String,
        #[source]
        source: io::Error,
    },

    /// The sampling subprocess exited mid-session. Recoverable: the caller
    /// decides whether to restart.
    #[error("sampling process exited ({})", describe_exit(.code))]
    ProcessExited { code: Option<i32> },

    /// Persisting samples at shutdown failed. The one fatal-but-loud case.
    #[error("failed to persist samples to {}: {source}", .path.display())]
    Persistence {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// Invalid or unreadable configuration.
    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PowerError {
    /// Actionable text for the human at the terminal, when there is any.
    pub fn remediation(&self) -> Option<String> {
        match self {
            Self::BinaryMissing { program } => Some(format!(
                "`{program}` ships with macOS. Run on a Mac, or pass --mock <chip> to use a simulated source."
            )),
            Self::PermissionDenied { program } => Some(format!(
                "`{program}` reads kernel power counters and must run as root. Re-run with sudo, or pass --mock <chip>."
            )),
            Self::Persistence { .. } => Some(
                "Samples recorded before this point may be incomplete. Check free disk space and directory permissions."
                    .to_string(),
            ),
            _ => None,
        }
    }

    /// Whether the session can continue (or be restarted) after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::ProcessExited { .. })
    }

    /// Classify a spawn failure so missing binaries and privilege problems
    /// are reported distinctly from generic I/O.
    pub(crate) fn from_spawn(program: &str, source: io::Error) -> Self {
        match source.kind() {
            io::ErrorKind::NotFound => Self::BinaryMissing {
                program: program.to_string(),
            },
            io::ErrorKind::PermissionDenied => Self::PermissionDenied {
                program: program.to_string(),
            },
            _ => Self::Spawn {
                program: program.to_string(),
                source,
            },
        }
    }
}

fn describe_exit(code: &Option<i32>) -> String {
    match code {
        Some(c) => format!("exit code {c}"),
        None => "terminated by signal".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, PowerError>;

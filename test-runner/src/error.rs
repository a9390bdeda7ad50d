//! Error taxonomy for the engine.
//!
//! Test-level outcomes (an assertion marker in the target output, or a plain
//! timeout) are not errors; they are reported through
//! [`Outcome`](crate::checker::Outcome).

use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// The target stream or device failed. Fatal to the current run.
    #[error("I/O error on {what}")]
    Io {
        what: String,
        #[source]
        source: io::Error,
    },

    /// A malformed plan, unknown power line or bad platform file. Raised
    /// before any hardware line is touched.
    #[error("configuration error: {0}")]
    Config(String),

    /// The platform file could not be read or parsed.
    #[error("failed to load platform config `{path}`")]
    ConfigFile {
        path: PathBuf,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// The target process could not be started.
    #[error("failed to spawn `{name}`")]
    Spawn {
        name: String,
        #[source]
        source: io::Error,
    },

    /// The target process exited with a non-zero status.
    #[error("`{name}` exited with {}", display_code(*.code))]
    ProcessExit { name: String, code: Option<i32> },

    /// The boot-completion pattern never appeared.
    #[error("`{platform}` did not boot: `{pattern}` not seen within {timeout:?}")]
    Boot {
        platform: String,
        pattern: String,
        timeout: std::time::Duration,
    },

    /// A runner operation was requested in a state that does not allow it.
    #[error("cannot {op} while runner is {state}")]
    InvalidState { op: &'static str, state: String },
}

impl Error {
    pub(crate) fn io(what: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            what: what.into(),
            source,
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}

fn display_code(code: Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (killed by signal)".to_string(),
    }
}

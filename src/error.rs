//! Error types for session pooling and command-mode management.
//!
//! This module defines all errors that can occur while acquiring sessions,
//! moving a session between CLI modes, and executing commands.

use std::fmt;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc::error::SendError;

/// Why a mode transition did not land in the expected mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModeEntryFailure {
    /// The mode prompt never appeared before the session gave up waiting.
    Timeout(String),
    /// A prompt appeared, but it is not the prompt of the mode being entered.
    UnexpectedPrompt(String),
    /// The session reported some other failure while the transition was running.
    Session(String),
}

impl fmt::Display for ModeEntryFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ModeEntryFailure::Timeout(output) => write!(f, "prompt timeout, output: {output}"),
            ModeEntryFailure::UnexpectedPrompt(prompt) => {
                write!(f, "unexpected prompt '{prompt}'")
            }
            ModeEntryFailure::Session(msg) => f.write_str(msg),
        }
    }
}

/// Errors that can occur during session pooling and mode management.
#[derive(Error, Debug)]
pub enum CliError {
    /// No session could be obtained from the pool before the deadline.
    ///
    /// The pool is left untouched; the caller may retry.
    #[error("cannot get session instance during {timeout:?}")]
    PoolExhausted { timeout: Duration },

    /// Entering a mode failed; the mode's one-time setup is not marked done.
    #[error("failed to enter mode '{mode}': {reason}")]
    ModeEntryFailed {
        mode: String,
        reason: ModeEntryFailure,
    },

    /// No exit command is defined for the specified mode.
    ///
    /// Only the root mode has no parent to step down to.
    #[error("{0} no exit command")]
    NoExitCommand(String),

    /// The mode does not exist in the registry.
    #[error("unknown mode {0}")]
    UnknownMode(String),

    /// The registered modes do not form a single-rooted tree.
    #[error("invalid mode tree: {0}")]
    InvalidModeTree(String),

    /// A prompt, action or error pattern failed to compile.
    #[error("invalid pattern '{pattern}': {source}")]
    InvalidPattern {
        pattern: String,
        #[source]
        source: regex::Error,
    },

    /// The expected prompt did not appear before the command timeout.
    ///
    /// The error contains the partial output received before the timeout.
    #[error("exec command timeout: {0}")]
    ExpectTimeout(String),

    /// Device output matched an entry of the command's error map.
    #[error("command error matched '{pattern}': {message}")]
    CommandError {
        pattern: String,
        message: String,
        output: String,
    },

    /// The shell channel was disconnected while waiting for a prompt.
    #[error("channel disconnect on wait prompt")]
    ChannelDisconnect,

    /// The connection has been closed.
    #[error("connect closed")]
    ConnectClosed,

    /// Configuration values are out of range.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No built-in template exists with this name.
    #[error("template not found: {0}")]
    TemplateNotFound(String),

    /// A connection attribute required by the session factory is missing.
    #[error("missing session attribute {0}")]
    MissingAttribute(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// An error occurred in the async-ssh2-tokio library.
    #[error("async ssh2 error: {0}")]
    Ssh2Error(#[from] async_ssh2_tokio::Error),

    /// An error occurred in the russh library.
    #[error("russh error: {0}")]
    RusshError(#[from] russh::Error),

    /// Failed to hand data to the shell I/O task.
    #[error("Failed to send data: {0}")]
    SendDataError(#[from] SendError<String>),
}

impl CliError {
    /// Wraps a session failure that happened while entering `mode`.
    pub(crate) fn mode_entry(mode: &str, err: CliError) -> CliError {
        let reason = match err {
            CliError::ExpectTimeout(output) => ModeEntryFailure::Timeout(output),
            CliError::ModeEntryFailed { reason, .. } => reason,
            other => ModeEntryFailure::Session(other.to_string()),
        };
        CliError::ModeEntryFailed {
            mode: mode.to_string(),
            reason,
        }
    }
}

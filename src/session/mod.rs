//! Session abstraction and the SSH transport.
//!
//! A [`Session`] is a live CLI connection that can send text and block until
//! the response matches an expected pattern. Pools create sessions through a
//! [`SessionFactory`] and compare [`SessionArgs`] to decide whether an idle
//! session can be reused.
//!
//! # Main Components
//!
//! - [`Session`] / [`SessionFactory`] - transport contract used by the pool and modes
//! - [`SessionArgs`] - creation parameters carried by every session
//! - [`ExpectState`] - incremental prompt/action/error matcher for transports
//! - [`SshSession`] / [`SshSessionFactory`] - interactive shell over SSH

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::fmt;
use std::time::{Duration, Instant};

use async_ssh2_tokio::client::{AuthMethod, Client};
use async_ssh2_tokio::{Config, ServerCheckMethod};
use log::{debug, trace};
use once_cell::sync::Lazy;
use regex::Regex;
use russh::{ChannelMsg, Preferred};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::runtime::Runtime;
use tokio::sync::mpsc::{self, Receiver, Sender};

use crate::config;
use crate::error::CliError;

pub use expect::{ActionMap, CONTROL_SEQUENCES, ErrorMap, ExpectState, ExpectStep, last_line};
pub use security::{ConnectionSecurityOptions, SecurityLevel};
pub use ssh::{SshSession, SshSessionFactory};

/// A live command-line connection to a device.
///
/// Implementations are exclusively owned by one caller at a time, so methods
/// take `&mut self` and never need internal locking.
pub trait Session: Send {
    /// Sends `command` followed by a newline and blocks until `expected` matches.
    ///
    /// Prompts matching `action_map` are answered while waiting. Once the
    /// expected pattern is seen, the output is checked against `error_map`.
    /// Returns everything received, including the echoed command and prompt.
    fn send_and_expect(
        &mut self,
        command: &str,
        expected: &str,
        action_map: Option<&ActionMap>,
        error_map: Option<&ErrorMap>,
    ) -> Result<String, CliError>;

    /// Whether the session can still be used. Sessions without a way to
    /// tell are treated as always valid.
    fn is_valid(&self) -> bool {
        true
    }

    /// Parameters the session was created with.
    fn args(&self) -> &SessionArgs;

    /// Re-establishes the transport and waits for any prompt matching `prompt`.
    fn reconnect(&mut self, prompt: &str, timeout: Option<Duration>) -> Result<(), CliError>;

    /// Releases the transport. Called when the pool evicts the session.
    fn close(&mut self) {}
}

/// Builds new sessions for a pool.
pub trait SessionFactory: Send + Sync {
    type Session: Session;

    fn new_session(&self, args: &SessionArgs) -> Result<Self::Session, CliError>;
}

/// A secret connection attribute, compared by SHA-256 digest and never printed.
#[derive(Clone)]
pub struct Secret {
    value: String,
    digest: [u8; 32],
}

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        let value = value.into();
        let mut hasher = Sha256::new();
        hasher.update(value.as_bytes());
        Self {
            digest: hasher.finalize().into(),
            value,
        }
    }

    pub fn expose(&self) -> &str {
        &self.value
    }
}

impl PartialEq for Secret {
    fn eq(&self, other: &Self) -> bool {
        self.digest == other.digest
    }
}

impl Eq for Secret {}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

/// Creation parameters of a session: session type, connection attributes,
/// secrets and the prompt pattern that signals the shell is ready.
///
/// Two sessions are interchangeable exactly when their args are equal.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SessionArgs {
    pub session_type: String,
    pub attrs: BTreeMap<String, String>,
    pub secrets: BTreeMap<String, Secret>,
    pub prompt: String,
}

impl SessionArgs {
    pub fn new(session_type: impl Into<String>) -> Self {
        Self {
            session_type: session_type.into(),
            ..Default::default()
        }
    }

    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }

    pub fn secret(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.secrets.insert(key.into(), Secret::new(value));
        self
    }

    pub fn prompt(mut self, prompt: impl Into<String>) -> Self {
        self.prompt = prompt.into();
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.attrs.get(key).map(String::as_str)
    }

    pub fn get_secret(&self, key: &str) -> Option<&str> {
        self.secrets.get(key).map(Secret::expose)
    }

    pub(crate) fn require(&self, key: &str) -> Result<&str, CliError> {
        self.get(key)
            .ok_or_else(|| CliError::MissingAttribute(key.to_string()))
    }

    /// `user@host:port` style label used in log lines.
    pub fn label(&self) -> String {
        match (self.get("user"), self.get("host")) {
            (Some(user), Some(host)) => {
                format!("{user}@{host}:{}", self.get("port").unwrap_or("22"))
            }
            (None, Some(host)) => host.to_string(),
            _ => self.session_type.clone(),
        }
    }
}

mod expect;
mod security;
mod ssh;

//! # climode - Pooled CLI sessions with mode-tree routing
//!
//! `climode` keeps a bounded pool of command-line sessions to network devices
//! and makes sure each session sits in the right CLI mode (user, privileged,
//! configuration, ...) before commands are sent.
//!
//! ## Features
//!
//! - **Session Pooling**: Bounded, thread-safe pool with blocking acquisition and a hard deadline
//! - **Parameter-aware Reuse**: Idle sessions are reused only when their creation args match
//! - **Mode Trees**: Device modes form a validated single-rooted tree
//! - **Minimal Routing**: Mode changes go through the lowest common ancestor
//! - **Prompt Detection**: Live sessions are probed to learn which mode they are really in
//! - **Scoped Guards**: Sessions return to the pool and modes are left on every exit path
//! - **SSH Transport**: Interactive shell sessions with selectable algorithm profiles
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use climode::config::PoolConfig;
//! use climode::pool::SessionPool;
//! use climode::session::{SessionArgs, SshSessionFactory};
//! use climode::templates;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let registry = Arc::new(templates::cisco("enable-secret")?);
//!     let pool = SessionPool::new(SshSessionFactory::new(), PoolConfig::default())?;
//!
//!     let args = SessionArgs::new("ssh")
//!         .attr("host", "192.168.1.1")
//!         .attr("user", "admin")
//!         .secret("password", "password");
//!
//!     let config = registry.id("Config")?;
//!     let mut cli = pool.checkout_in_mode(&args, registry.clone(), Some(config))?;
//!     let output = cli.send("interface GigabitEthernet0/1")?;
//!     println!("{output}");
//!     Ok(())
//! }
//! ```
//!
//! ## Main Components
//!
//! - [`pool::SessionPool`] - Bounded session pool
//! - [`mode::ModeRegistry`] - Validated tree of command modes
//! - [`router`] - Route calculation and prompt-based mode detection
//! - [`service::CliService`] - Session bound to its current mode
//! - [`session::Session`] - Transport contract, with [`session::SshSession`] as implementation
//! - [`error::CliError`] - Error types for pooling, mode transitions and transport

pub mod config;
pub mod error;
pub mod mode;
pub mod pool;
pub mod router;
pub mod service;
pub mod session;
pub mod templates;

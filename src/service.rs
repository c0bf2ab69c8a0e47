//! A session bound to its current command mode.
//!
//! [`CliService`] keeps track of which mode its session is in, sends commands
//! with the current prompt as the default expectation, and walks the mode
//! tree when asked for another mode or after a reconnect.

use std::cmp::Reverse;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};

use crate::error::CliError;
use crate::mode::{ModeId, ModeRegistry};
use crate::router::{calculate_route_steps, determine_current_mode};
use crate::session::{ActionMap, ErrorMap, Session};

/// A session together with the command mode it is currently in.
pub struct CliService<S: Session> {
    session: S,
    registry: Arc<ModeRegistry>,
    mode: ModeId,
}

impl<S: Session> CliService<S> {
    /// Binds `session` and moves it into `requested`.
    ///
    /// The session's actual mode is probed first (assuming `requested` if the
    /// prompt is not recognised) and its enter actions are re-sent.
    pub fn new(session: S, registry: Arc<ModeRegistry>, requested: ModeId) -> Result<Self, CliError> {
        let mut service = Self::attach(session, registry, requested);
        service.synchronize(requested)?;
        Ok(service)
    }

    /// Wraps `session` assuming it already sits in `mode`, without talking to it.
    pub fn attach(session: S, registry: Arc<ModeRegistry>, mode: ModeId) -> Self {
        Self {
            session,
            registry,
            mode,
        }
    }

    /// Probes the real mode, re-sends its enter actions, then routes to `requested`.
    pub fn synchronize(&mut self, requested: ModeId) -> Result<(), CliError> {
        self.check_mode(requested)?;
        let registry = Arc::clone(&self.registry);
        self.mode = determine_current_mode(&mut self.session, &registry, requested)?;
        registry.enter_actions(self.mode, &mut self.session)?;
        self.change_mode(requested)
    }

    /// Probes the real mode and re-sends its enter actions without moving.
    pub fn synchronize_in_place(&mut self) -> Result<(), CliError> {
        let registry = Arc::clone(&self.registry);
        self.mode = determine_current_mode(&mut self.session, &registry, self.mode)?;
        registry.enter_actions(self.mode, &mut self.session)
    }

    pub fn current_mode(&self) -> ModeId {
        self.mode
    }

    pub fn current_mode_name(&self) -> &str {
        self.registry.name(self.mode)
    }

    pub fn registry(&self) -> &Arc<ModeRegistry> {
        &self.registry
    }

    pub fn session(&self) -> &S {
        &self.session
    }

    pub fn session_mut(&mut self) -> &mut S {
        &mut self.session
    }

    pub fn into_session(self) -> S {
        self.session
    }

    /// Sends `command` and waits for the current mode's prompt.
    pub fn send(&mut self, command: &str) -> Result<String, CliError> {
        self.send_command(command, None, None, None)
    }

    /// Sends `command` and waits for `expected_string`, or the current mode's
    /// prompt when it is `None`. Session errors are returned as-is.
    pub fn send_command(
        &mut self,
        command: &str,
        expected_string: Option<&str>,
        action_map: Option<&ActionMap>,
        error_map: Option<&ErrorMap>,
    ) -> Result<String, CliError> {
        let expected = match expected_string {
            Some(expected) => expected,
            None => self.registry.mode(self.mode).prompt(),
        };
        self.session
            .send_and_expect(command, expected, action_map, error_map)
    }

    /// Walks the tree from the current mode to `target`.
    ///
    /// The tracked mode follows every successful step, so after a failure it
    /// still names the mode the session was last seen in.
    pub fn change_mode(&mut self, target: ModeId) -> Result<(), CliError> {
        self.check_mode(target)?;
        let registry = Arc::clone(&self.registry);
        for step in calculate_route_steps(&registry, self.mode, target) {
            step.apply(&registry, &mut self.session)?;
            self.mode = step.destination(&registry);
        }
        Ok(())
    }

    fn check_mode(&self, id: ModeId) -> Result<(), CliError> {
        match self.registry.get(id) {
            Some(_) => Ok(()),
            None => Err(CliError::UnknownMode(format!("#{}", id.index()))),
        }
    }

    /// Re-establishes the transport and returns to the mode that was current
    /// before the call.
    pub fn reconnect(&mut self, timeout: Option<Duration>) -> Result<(), CliError> {
        let requested = self.mode;
        debug!("Reconnecting, will restore mode {}", self.current_mode_name());
        let registry = Arc::clone(&self.registry);
        self.session
            .reconnect(registry.prompts_pattern(), timeout)?;
        self.synchronize(requested)
    }

    /// Primes a fresh session: every mode, deepest first, is entered, gets its
    /// setup commands, and is left again. Ends in the mode current before the call.
    pub fn on_session_start(&mut self) -> Result<(), CliError> {
        let registry = Arc::clone(&self.registry);
        let original = self.mode;

        let mut order = registry
            .iter()
            .map(|(id, mode)| (id, mode.depth()))
            .collect::<Vec<_>>();
        order.sort_by_key(|(id, depth)| (Reverse(*depth), *id));

        for (id, _) in order {
            match registry.mode(id).parent() {
                Some(parent) => {
                    self.change_mode(parent)?;
                    registry.prime(id, &mut self.session)?;
                    self.mode = id;
                    registry.step_down(id, &mut self.session)?;
                    self.mode = parent;
                }
                None => {
                    self.change_mode(id)?;
                    registry.prime(id, &mut self.session)?;
                }
            }
        }
        self.change_mode(original)
    }

    /// Moves to `mode` until the returned guard is dropped or exited.
    ///
    /// If getting there fails, the service tries to return to the previous
    /// mode before reporting the error.
    pub fn enter_mode(&mut self, mode: ModeId) -> Result<ModeGuard<'_, S>, CliError> {
        let previous = self.mode;
        if let Err(err) = self.change_mode(mode) {
            if let Err(restore) = self.change_mode(previous) {
                warn!("Failed to restore mode after entry error: {restore}");
            }
            return Err(err);
        }
        Ok(ModeGuard {
            service: self,
            previous,
            active: true,
        })
    }

    /// Runs `f` inside `mode`, returning to the current mode afterwards.
    pub fn with_mode<R>(
        &mut self,
        mode: ModeId,
        f: impl FnOnce(&mut CliService<S>) -> Result<R, CliError>,
    ) -> Result<R, CliError> {
        let mut guard = self.enter_mode(mode)?;
        let result = f(&mut *guard);
        let exited = guard.exit();
        let value = result?;
        exited?;
        Ok(value)
    }
}

/// Scope in which a [`CliService`] sits in an entered mode.
///
/// Dropping the guard steps back to the mode that was current before entry;
/// errors during that drop are logged. Use [`ModeGuard::exit`] to see them.
pub struct ModeGuard<'a, S: Session> {
    service: &'a mut CliService<S>,
    previous: ModeId,
    active: bool,
}

impl<S: Session> ModeGuard<'_, S> {
    pub fn exit(mut self) -> Result<(), CliError> {
        self.active = false;
        self.service.change_mode(self.previous)
    }
}

impl<S: Session> Deref for ModeGuard<'_, S> {
    type Target = CliService<S>;

    fn deref(&self) -> &Self::Target {
        self.service
    }
}

impl<S: Session> DerefMut for ModeGuard<'_, S> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.service
    }
}

impl<S: Session> Drop for ModeGuard<'_, S> {
    fn drop(&mut self) {
        if !self.active {
            return;
        }
        if let Err(err) = self.service.change_mode(self.previous) {
            warn!(
                "Failed to leave mode {}: {err}",
                self.service.current_mode_name()
            );
        }
    }
}

//! Bounded pool of CLI sessions.
//!
//! [`SessionPool`] hands out at most `max_pool_size` sessions at a time.
//! Callers block until a session is idle or capacity frees up, bounded by a
//! single deadline taken when the request starts. Idle sessions are reused
//! when their creation args match the request and evicted otherwise.
//!
//! # Main Components
//!
//! - [`SessionPool`] - acquisition, return and eviction
//! - [`PooledSession`] - a checked-out session; gives its slot back if dropped
//! - [`SessionCheckout`] / [`PooledCliService`] - scoped wrappers that return
//!   the session to the pool when they go out of scope

use std::collections::{HashSet, VecDeque};
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use log::{debug, warn};
use parking_lot::{Condvar, Mutex};

use crate::config::{self, PoolConfig};
use crate::error::CliError;
use crate::session::{ActionMap, ErrorMap, Session, SessionArgs, SessionFactory};

pub use guard::{PooledCliService, SessionCheckout};

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

struct IdleSession<S> {
    id: u64,
    args: SessionArgs,
    session: S,
}

struct PoolState<S> {
    idle: VecDeque<IdleSession<S>>,
    /// Ids of every session alive on behalf of the pool, idle or checked out.
    created: HashSet<u64>,
}

struct Shared<S> {
    state: Mutex<PoolState<S>>,
    available: Condvar,
}

impl<S> Shared<S> {
    fn forget(&self, id: u64) -> bool {
        let mut state = self.state.lock();
        let removed = state.created.remove(&id);
        self.available.notify_one();
        removed
    }
}

/// Ties a checked-out session to its pool slot.
struct Lease<S> {
    id: u64,
    pool: Weak<Shared<S>>,
    armed: bool,
}

impl<S> Lease<S> {
    fn belongs_to(&self, shared: &Arc<Shared<S>>) -> bool {
        Weak::ptr_eq(&self.pool, &Arc::downgrade(shared))
    }
}

impl<S> Drop for Lease<S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Some(shared) = self.pool.upgrade()
            && shared.forget(self.id)
        {
            warn!(
                "Pooled session {} dropped without being returned, slot released",
                self.id
            );
        }
    }
}

/// A session checked out of a [`SessionPool`].
///
/// Hand it back with [`SessionPool::return_session`] or
/// [`SessionPool::remove_session`]. Dropping it instead frees its slot.
pub struct PooledSession<S> {
    session: S,
    args: SessionArgs,
    lease: Lease<S>,
}

impl<S> PooledSession<S> {
    /// Pool-unique id of the underlying session.
    pub fn id(&self) -> u64 {
        self.lease.id
    }
}

impl<S> Deref for PooledSession<S> {
    type Target = S;

    fn deref(&self) -> &S {
        &self.session
    }
}

impl<S> DerefMut for PooledSession<S> {
    fn deref_mut(&mut self) -> &mut S {
        &mut self.session
    }
}

impl<S: Session> Session for PooledSession<S> {
    fn send_and_expect(
        &mut self,
        command: &str,
        expected: &str,
        action_map: Option<&ActionMap>,
        error_map: Option<&ErrorMap>,
    ) -> Result<String, CliError> {
        self.session
            .send_and_expect(command, expected, action_map, error_map)
    }

    fn is_valid(&self) -> bool {
        self.session.is_valid()
    }

    /// The args the session was requested with, which the pool matches on.
    fn args(&self) -> &SessionArgs {
        &self.args
    }

    fn reconnect(&mut self, prompt: &str, timeout: Option<Duration>) -> Result<(), CliError> {
        self.session.reconnect(prompt, timeout)
    }

    fn close(&mut self) {
        self.session.close()
    }
}

/// Bounded, thread-safe pool of sessions built by a [`SessionFactory`].
pub struct SessionPool<F: SessionFactory> {
    factory: F,
    config: PoolConfig,
    shared: Arc<Shared<F::Session>>,
}

impl<F: SessionFactory> SessionPool<F> {
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, CliError> {
        config.validate()?;
        Ok(Self {
            factory,
            config,
            shared: Arc::new(Shared {
                state: Mutex::new(PoolState {
                    idle: VecDeque::new(),
                    created: HashSet::new(),
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Sessions alive on behalf of the pool, idle and checked out.
    pub fn created_sessions(&self) -> usize {
        self.shared.state.lock().created.len()
    }

    pub fn idle_sessions(&self) -> usize {
        self.shared.state.lock().idle.len()
    }

    /// Returns a session created with `args`, blocking up to the pool timeout.
    ///
    /// In order of preference: an idle session with equal args; a new session
    /// after evicting an idle one with other args; a new session while below
    /// capacity; otherwise wait for a return or eviction and try again. The
    /// deadline is fixed at entry, wakeups never extend it. A timeout too
    /// large to form a deadline waits without limit.
    pub fn get_session(
        &self,
        args: &SessionArgs,
    ) -> Result<PooledSession<F::Session>, CliError> {
        let timeout = self.config.pool_timeout();
        let deadline = config::deadline_after(timeout);
        let mut evicted = Vec::new();
        let result = self.acquire(args, deadline, timeout, &mut evicted);
        for mut session in evicted {
            session.close();
        }
        result
    }

    fn acquire(
        &self,
        args: &SessionArgs,
        deadline: Option<Instant>,
        timeout: Duration,
        evicted: &mut Vec<F::Session>,
    ) -> Result<PooledSession<F::Session>, CliError> {
        let mut state = self.shared.state.lock();
        loop {
            let matching = state.idle.iter().position(|idle| idle.args == *args);
            if let Some(idle) = matching.and_then(|pos| state.idle.remove(pos)) {
                debug!("Getting session {} from the pool", idle.id);
                return Ok(self.lease(idle.id, idle.args, idle.session));
            }

            if let Some(stale) = state.idle.pop_front() {
                debug!(
                    "Session args changed, evicting idle session {} for {}",
                    stale.id,
                    args.label()
                );
                state.created.remove(&stale.id);
                evicted.push(stale.session);
            }

            if state.created.len() < self.config.max_pool_size {
                let id = NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed);
                state.created.insert(id);
                drop(state);
                return self.create(id, args);
            }

            match deadline {
                Some(deadline) if Instant::now() >= deadline => {
                    debug!("No session available within {:?}", timeout);
                    return Err(CliError::PoolExhausted { timeout });
                }
                Some(deadline) => {
                    self.shared.available.wait_until(&mut state, deadline);
                }
                None => self.shared.available.wait(&mut state),
            }
        }
    }

    /// Runs the factory outside the lock; the slot for `id` is already reserved.
    fn create(
        &self,
        id: u64,
        args: &SessionArgs,
    ) -> Result<PooledSession<F::Session>, CliError> {
        debug!("Creating new session {} for {}", id, args.label());
        match self.factory.new_session(args) {
            Ok(session) => Ok(self.lease(id, args.clone(), session)),
            Err(err) => {
                debug!("Session factory failed, releasing slot {}: {}", id, err);
                self.shared.forget(id);
                Err(err)
            }
        }
    }

    fn lease(&self, id: u64, args: SessionArgs, session: F::Session) -> PooledSession<F::Session> {
        PooledSession {
            session,
            args,
            lease: Lease {
                id,
                pool: Arc::downgrade(&self.shared),
                armed: true,
            },
        }
    }

    /// Puts `session` back for reuse, or evicts it if it reports itself invalid.
    pub fn return_session(&self, session: PooledSession<F::Session>) {
        let PooledSession {
            session,
            args,
            mut lease,
        } = session;
        let id = lease.id;
        debug!("Return session {} to the pool", id);
        if !lease.belongs_to(&self.shared) {
            warn!("Session {} belongs to another pool, closing it", id);
            close_foreign(session, lease);
            return;
        }
        lease.armed = false;

        let rejected = {
            let mut state = self.shared.state.lock();
            let rejected = if !state.created.contains(&id) {
                warn!("Session {} is no longer tracked by the pool, closing it", id);
                Some(session)
            } else if !session.is_valid() {
                debug!("Session {} is no longer valid, evicting it", id);
                state.created.remove(&id);
                Some(session)
            } else {
                state.idle.push_back(IdleSession { id, args, session });
                None
            };
            self.shared.available.notify_one();
            rejected
        };

        if let Some(mut session) = rejected {
            session.close();
        }
    }

    /// Evicts `session` permanently, freeing its slot.
    pub fn remove_session(&self, session: PooledSession<F::Session>) {
        let PooledSession {
            mut session,
            mut lease,
            ..
        } = session;
        debug!("Removing session {}", lease.id);
        if !lease.belongs_to(&self.shared) {
            warn!("Session {} belongs to another pool, closing it", lease.id);
            close_foreign(session, lease);
            return;
        }
        lease.armed = false;
        self.shared.forget(lease.id);
        session.close();
    }
}

/// Closes a session handed to the wrong pool; dropping its armed lease frees
/// the slot in the pool that created it.
fn close_foreign<S: Session>(mut session: S, lease: Lease<S>) {
    session.close();
    drop(lease);
}

mod guard;

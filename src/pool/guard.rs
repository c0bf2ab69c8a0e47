use std::sync::Arc;

use super::*;
use crate::mode::{ModeId, ModeRegistry};
use crate::service::CliService;

/// A pooled session that goes back to its pool when dropped.
pub struct SessionCheckout<'p, F: SessionFactory> {
    pool: &'p SessionPool<F>,
    // Only `None` while being dropped or consumed.
    session: Option<PooledSession<F::Session>>,
}

impl<'p, F: SessionFactory> SessionCheckout<'p, F> {
    /// Evicts the session instead of returning it, e.g. after a transport failure.
    pub fn discard(mut self) {
        if let Some(session) = self.session.take() {
            self.pool.remove_session(session);
        }
    }

    /// Keeps the session past this scope; the caller must hand it back.
    pub fn into_inner(mut self) -> Option<PooledSession<F::Session>> {
        self.session.take()
    }
}

impl<F: SessionFactory> Deref for SessionCheckout<'_, F> {
    type Target = PooledSession<F::Session>;

    fn deref(&self) -> &Self::Target {
        self.session.as_ref().expect("session is present until drop")
    }
}

impl<F: SessionFactory> DerefMut for SessionCheckout<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.session.as_mut().expect("session is present until drop")
    }
}

impl<F: SessionFactory> Drop for SessionCheckout<'_, F> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            self.pool.return_session(session);
        }
    }
}

/// A pooled session bound to a command mode; returned to the pool when dropped.
pub struct PooledCliService<'p, F: SessionFactory> {
    pool: &'p SessionPool<F>,
    service: Option<CliService<PooledSession<F::Session>>>,
}

impl<F: SessionFactory> PooledCliService<'_, F> {
    /// Evicts the session instead of returning it.
    pub fn discard(mut self) {
        if let Some(service) = self.service.take() {
            self.pool.remove_session(service.into_session());
        }
    }
}

impl<F: SessionFactory> Deref for PooledCliService<'_, F> {
    type Target = CliService<PooledSession<F::Session>>;

    fn deref(&self) -> &Self::Target {
        self.service.as_ref().expect("service is present until drop")
    }
}

impl<F: SessionFactory> DerefMut for PooledCliService<'_, F> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.service.as_mut().expect("service is present until drop")
    }
}

impl<F: SessionFactory> Drop for PooledCliService<'_, F> {
    fn drop(&mut self) {
        if let Some(service) = self.service.take() {
            self.pool.return_session(service.into_session());
        }
    }
}

impl<F: SessionFactory> SessionPool<F> {
    /// Checks a session out for the current scope.
    pub fn checkout(&self, args: &SessionArgs) -> Result<SessionCheckout<'_, F>, CliError> {
        let session = self.get_session(args)?;
        Ok(SessionCheckout {
            pool: self,
            session: Some(session),
        })
    }

    /// Checks a session out and binds it to `mode`, or to whatever mode it is
    /// found in when `mode` is `None`.
    ///
    /// Args without a prompt get the union of all registered prompts, so the
    /// transport recognises any mode as ready. If the mode cannot be reached,
    /// or `mode` is not an id of `registry`, the session goes back to the
    /// pool and the error is returned.
    ///
    /// Dropping the returned service hands the session back in whatever mode
    /// it was last in; the next checkout probes the prompt and routes from
    /// there. Use [`CliService::enter_mode`] for modes that must be left
    /// before release.
    pub fn checkout_in_mode(
        &self,
        args: &SessionArgs,
        registry: Arc<ModeRegistry>,
        mode: Option<ModeId>,
    ) -> Result<PooledCliService<'_, F>, CliError> {
        let mut args = args.clone();
        if args.prompt.is_empty() {
            args.prompt = registry.prompts_pattern().to_string();
        }
        let session = self.get_session(&args)?;

        let assumed = mode.unwrap_or_else(|| registry.root());
        let mut service = CliService::attach(session, registry, assumed);
        let bound = match mode {
            Some(mode) => service.synchronize(mode),
            None => service.synchronize_in_place(),
        };
        if let Err(err) = bound {
            self.return_session(service.into_session());
            return Err(err);
        }

        Ok(PooledCliService {
            pool: self,
            service: Some(service),
        })
    }
}

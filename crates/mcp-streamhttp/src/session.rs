//! Session lifecycle for a single transport instance.
//!
//! A session is negotiated on the first `initialize` POST: in stateful mode
//! the generator yields a fresh opaque id which is returned to the client in
//! the `Mcp-Session-Id` response header and required on every later request.
//! In stateless mode (no generator) no session header is exchanged, but the
//! initialization gate still applies to every non-init request.

use std::sync::Arc;

use crate::SessionId;
use crate::error::TransportError;

/// Yields the id for a newly initialized session.
pub type SessionIdGenerator = Arc<dyn Fn() -> SessionId + Send + Sync>;

/// Default generator: UUID v4.
pub fn random_session_id() -> SessionId {
    uuid::Uuid::new_v4().to_string().into()
}

pub(crate) struct SessionState {
    generator: Option<SessionIdGenerator>,
    session_id: Option<SessionId>,
    initialized: bool,
}

impl SessionState {
    pub(crate) fn new(generator: Option<SessionIdGenerator>) -> Self {
        Self {
            generator,
            session_id: None,
            initialized: false,
        }
    }

    pub(crate) fn session_id(&self) -> Option<SessionId> {
        self.session_id.clone()
    }

    /// Handle an initialization request. Re-initialization is rejected only
    /// when a session id has been assigned; a stateless transport tolerates
    /// repeated initialize requests.
    pub(crate) fn initialize(&mut self) -> Result<Option<SessionId>, TransportError> {
        if self.initialized && self.session_id.is_some() {
            return Err(TransportError::AlreadyInitialized);
        }
        self.session_id = self.generator.as_ref().map(|generate| generate());
        self.initialized = true;
        Ok(self.session_id.clone())
    }

    /// Validation ladder applied to every non-initialization request.
    pub(crate) fn validate(&self, header: Option<&str>) -> Result<(), TransportError> {
        if !self.initialized {
            return Err(TransportError::NotInitialized);
        }
        let Some(expected) = &self.session_id else {
            // Stateless: nothing to compare.
            return Ok(());
        };
        match header {
            None => Err(TransportError::MissingSessionHeader),
            Some(given) if given != expected.as_ref() => Err(TransportError::SessionNotFound),
            Some(_) => Ok(()),
        }
    }
}

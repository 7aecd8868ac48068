//! Per-connection SASL authentication state.
//!
//! The ingress tier does not implement SASL mechanisms itself; the
//! SaslHandshake and SaslAuthenticate handlers drive this state machine and
//! the pipeline reads it to decide whether the next frame is a raw legacy
//! token (see `pipeline::auth_v0`).
//!
//! ```text
//! Initial -> Handshake -> Authenticate -> Complete
//!                 \             \
//!                  +-------------+-----> Failed
//! ```
//!
//! Observers registered on the server are invoked on every transition.

use std::fmt;
use std::sync::{Arc, Mutex};

use tracing::debug;

use crate::error::{IngressError, Result};

/// SASL exchange progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SaslState {
    /// Nothing received yet.
    Initial,
    /// SaslHandshake received; mechanism being negotiated.
    Handshake,
    /// Mechanism selected; tokens are being exchanged.
    Authenticate,
    /// Client authenticated.
    Complete,
    /// Authentication failed; the connection will be closed.
    Failed,
}

impl fmt::Display for SaslState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Initial => "initial",
            Self::Handshake => "handshake",
            Self::Authenticate => "authenticate",
            Self::Complete => "complete",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

impl SaslState {
    fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initial, Self::Handshake)
                | (Self::Handshake, Self::Authenticate)
                | (Self::Authenticate, Self::Authenticate)
                | (Self::Authenticate, Self::Complete)
                | (Self::Initial | Self::Handshake | Self::Authenticate, Self::Failed)
        )
    }
}

/// Hook invoked on every authentication state transition.
pub trait AuthStateObserver: Send + Sync {
    fn on_transition(&self, connection_id: u64, from: SaslState, to: SaslState);
}

#[derive(Debug)]
struct Inner {
    state: SaslState,
    handshake_v0: bool,
    mechanism: Option<String>,
    principal: Option<String>,
}

/// Authentication state of one connection.
pub struct AuthState {
    connection_id: u64,
    inner: Mutex<Inner>,
    observers: Vec<Arc<dyn AuthStateObserver>>,
}

impl AuthState {
    /// Listeners without SASL start out authenticated.
    #[must_use]
    pub fn new(
        connection_id: u64,
        sasl_required: bool,
        observers: Vec<Arc<dyn AuthStateObserver>>,
    ) -> Self {
        let state = if sasl_required {
            SaslState::Initial
        } else {
            SaslState::Complete
        };
        Self {
            connection_id,
            inner: Mutex::new(Inner {
                state,
                handshake_v0: false,
                mechanism: None,
                principal: None,
            }),
            observers,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    #[must_use]
    pub fn state(&self) -> SaslState {
        self.lock().state
    }

    #[must_use]
    pub fn is_authenticated(&self) -> bool {
        self.state() == SaslState::Complete
    }

    /// True while the client negotiated with SaslHandshake v0 and has not
    /// finished authenticating: the next frame is a raw token rather than a
    /// request.
    #[must_use]
    pub fn needs_v0_framing(&self) -> bool {
        let inner = self.lock();
        inner.handshake_v0 && inner.state == SaslState::Authenticate
    }

    #[must_use]
    pub fn mechanism(&self) -> Option<String> {
        self.lock().mechanism.clone()
    }

    #[must_use]
    pub fn principal(&self) -> Option<String> {
        self.lock().principal.clone()
    }

    /// `Initial -> Handshake`.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Auth`] if the exchange already started.
    pub fn begin_handshake(&self) -> Result<()> {
        self.transition(SaslState::Handshake, |_| {})
    }

    /// `Handshake -> Authenticate` with the selected mechanism. `v0` marks
    /// a legacy SaslHandshake v0 client that sends raw tokens next.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Auth`] outside the handshake state.
    pub fn select_mechanism(&self, mechanism: impl Into<String>, v0: bool) -> Result<()> {
        let mechanism = mechanism.into();
        self.transition(SaslState::Authenticate, move |inner| {
            inner.mechanism = Some(mechanism);
            inner.handshake_v0 = v0;
        })
    }

    /// Record an intermediate token round; the state stays `Authenticate`.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Auth`] outside the authenticate state.
    pub fn continue_exchange(&self) -> Result<()> {
        self.transition(SaslState::Authenticate, |_| {})
    }

    /// `Authenticate -> Complete`.
    ///
    /// # Errors
    ///
    /// Returns [`IngressError::Auth`] outside the authenticate state.
    pub fn complete(&self, principal: impl Into<String>) -> Result<()> {
        let principal = principal.into();
        self.transition(SaslState::Complete, move |inner| {
            inner.principal = Some(principal);
        })
    }

    /// Move to `Failed`. A no-op once complete or already failed.
    pub fn fail(&self) {
        let _ = self.transition(SaslState::Failed, |_| {});
    }

    fn transition(&self, next: SaslState, update: impl FnOnce(&mut Inner)) -> Result<()> {
        let from = {
            let mut inner = self.lock();
            let from = inner.state;
            if !from.can_transition_to(next) {
                return Err(IngressError::Auth(format!(
                    "invalid SASL transition {from} -> {next}"
                )));
            }
            inner.state = next;
            update(&mut inner);
            from
        };

        debug!(connection_id = self.connection_id, %from, to = %next, "SASL state transition");
        for observer in &self.observers {
            observer.on_transition(self.connection_id, from, next);
        }
        Ok(())
    }
}

impl fmt::Debug for AuthState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthState")
            .field("connection_id", &self.connection_id)
            .field("inner", &*self.lock())
            .finish_non_exhaustive()
    }
}

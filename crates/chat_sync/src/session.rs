use chrono::{DateTime, Duration, Utc};
use shared::domain::UserId;
use tokio::sync::watch;

/// Authenticated identity handed to every downstream component.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: UserId,
    pub access_token: String,
}

/// Tokens issued by the platform's auth service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthSession {
    pub user_id: UserId,
    pub email: Option<String>,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
}

impl AuthSession {
    pub fn identity(&self) -> Identity {
        Identity {
            user_id: self.user_id,
            access_token: self.access_token.clone(),
        }
    }

    pub fn expires_within(&self, margin: Duration, now: DateTime<Utc>) -> bool {
        self.expires_at - now <= margin
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionState {
    Loading,
    SignedOut,
    SignedIn(AuthSession),
}

impl SessionState {
    fn user_id(&self) -> Option<UserId> {
        match self {
            SessionState::SignedIn(session) => Some(session.user_id),
            _ => None,
        }
    }
}

/// Result of a session transition as seen by downstream components.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionTransition {
    /// The user changed (including to/from no user); caches and subscriptions must be rebuilt.
    IdentityChanged,
    /// Same user, new tokens.
    Refreshed,
    Unchanged,
}

/// Holds the current session. Components must not issue network calls
/// while it is `Loading` or `SignedOut`.
pub struct SessionGate {
    state: watch::Sender<SessionState>,
}

impl Default for SessionGate {
    fn default() -> Self {
        Self::new()
    }
}

impl SessionGate {
    pub fn new() -> Self {
        let (state, _) = watch::channel(SessionState::Loading);
        Self { state }
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn is_loading(&self) -> bool {
        matches!(*self.state.borrow(), SessionState::Loading)
    }

    pub fn identity(&self) -> Option<Identity> {
        match &*self.state.borrow() {
            SessionState::SignedIn(session) => Some(session.identity()),
            _ => None,
        }
    }

    pub fn auth_session(&self) -> Option<AuthSession> {
        match &*self.state.borrow() {
            SessionState::SignedIn(session) => Some(session.clone()),
            _ => None,
        }
    }

    pub fn begin_resolving(&self) -> SessionTransition {
        self.transition(SessionState::Loading)
    }

    pub fn resolve(&self, session: Option<AuthSession>) -> SessionTransition {
        self.transition(match session {
            Some(session) => SessionState::SignedIn(session),
            None => SessionState::SignedOut,
        })
    }

    fn transition(&self, next: SessionState) -> SessionTransition {
        let mut outcome = SessionTransition::Unchanged;
        self.state.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            outcome = if current.user_id() != next.user_id() {
                SessionTransition::IdentityChanged
            } else if matches!(
                (&*current, &next),
                (SessionState::SignedIn(_), SessionState::SignedIn(_))
            ) {
                SessionTransition::Refreshed
            } else {
                // Loading <-> SignedOut: still no user.
                SessionTransition::Unchanged
            };
            *current = next.clone();
            true
        });
        outcome
    }
}

#[cfg(test)]
#[path = "tests/session_tests.rs"]
mod tests;

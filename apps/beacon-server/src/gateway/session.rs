//! Per-connection authentication lifecycle.
//!
//! ```text
//! Unauthenticated --register/login/authenticate--> Authenticated
//! Authenticated   --logout-->                      Unauthenticated
//! (any)           --disconnect-->                  Closed
//! ```
//!
//! Nothing leaves `Closed`.

use crate::error::HubError;
use crate::models::user::UserProfile;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Unauthenticated,
    Authenticated(UserProfile),
    Closed,
}

impl SessionState {
    pub fn user(&self) -> Option<&UserProfile> {
        match self {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }

    pub fn is_authenticated(&self) -> bool {
        matches!(self, SessionState::Authenticated(_))
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, SessionState::Closed)
    }

    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Unauthenticated => "unauthenticated",
            SessionState::Authenticated(_) => "authenticated",
            SessionState::Closed => "closed",
        }
    }

    /// The bound user, or the error a command needing authentication gets.
    pub fn require_authenticated(&self) -> Result<UserProfile, HubError> {
        self.user().cloned().ok_or(HubError::AuthenticationRequired)
    }

    /// Checks that an authentication attempt may start from this state.
    pub fn ensure_can_authenticate(&self) -> Result<(), HubError> {
        match self {
            SessionState::Unauthenticated => Ok(()),
            SessionState::Authenticated(_) => Err(HubError::AlreadyAuthenticated),
            SessionState::Closed => Err(HubError::ConnectionClosed),
        }
    }

    pub fn authenticate(&mut self, user: UserProfile) -> Result<(), HubError> {
        self.ensure_can_authenticate()?;
        *self = SessionState::Authenticated(user);
        Ok(())
    }

    /// Returns the user that was bound, or `None` if there was nothing to log out.
    pub fn logout(&mut self) -> Option<UserProfile> {
        match std::mem::take(self) {
            SessionState::Authenticated(user) => Some(user),
            SessionState::Closed => {
                *self = SessionState::Closed;
                None
            }
            SessionState::Unauthenticated => None,
        }
    }

    /// Moves to `Closed`. Returns the user that was bound, if any.
    pub fn close(&mut self) -> Option<UserProfile> {
        match std::mem::replace(self, SessionState::Closed) {
            SessionState::Authenticated(user) => Some(user),
            _ => None,
        }
    }
}

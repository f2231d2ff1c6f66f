//! Identity-provider actions guarded by the control plane.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One outbound authentication call. Each action owns an independent breaker and quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuthAction {
    Login,
    Signup,
    PasswordReset,
    PasswordChange,
    Logout,
}

impl AuthAction {
    /// Every action, in a stable order.
    pub const ALL: [AuthAction; 5] = [
        AuthAction::Login,
        AuthAction::Signup,
        AuthAction::PasswordReset,
        AuthAction::PasswordChange,
        AuthAction::Logout,
    ];

    /// Name used in storage keys and log fields.
    pub fn as_str(self) -> &'static str {
        match self {
            AuthAction::Login => "login",
            AuthAction::Signup => "signup",
            AuthAction::PasswordReset => "password_reset",
            AuthAction::PasswordChange => "password_change",
            AuthAction::Logout => "logout",
        }
    }
}

impl fmt::Display for AuthAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when parsing an unknown action name.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown auth action '{0}'")]
pub struct UnknownAction(pub String);

impl FromStr for AuthAction {
    type Err = UnknownAction;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        AuthAction::ALL
            .into_iter()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| UnknownAction(s.to_string()))
    }
}

use thiserror::Error;

use crate::api::TransportError;
use crate::storage::StoreError;

/// Client-side input rule that was violated, detected before any network call.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Email address must look like name@domain.tld")]
    InvalidEmail,

    #[error("Username is required")]
    EmptyUsername,

    #[error("Password too short (minimum {0} characters)")]
    PasswordTooShort(usize),

    #[error("Password must contain an upper-case letter")]
    PasswordMissingUppercase,

    #[error("Password must contain a lower-case letter")]
    PasswordMissingLowercase,

    #[error("Password must contain a digit")]
    PasswordMissingDigit,

    #[error("Password must contain one of {0}")]
    PasswordMissingSymbol(&'static str),
}

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Login failed")]
    LoginFailed,

    /// The identity server rejected the call; `payload` is its response body as sent.
    #[error("Server rejected request ({status}): {payload}")]
    Server { status: u16, payload: String },

    #[error("Malformed token: {0}")]
    MalformedToken(String),

    #[error("Session refresh failed: {0}")]
    RefreshFailed(String),

    #[error("Not authenticated")]
    NotAuthenticated,

    /// The call finished after a logout or a newer login replaced the attempt it belonged to.
    #[error("Session attempt was superseded")]
    Superseded,

    #[error("Network error: {0}")]
    Transport(#[from] TransportError),

    #[error("Credential storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl AuthError {
    /// Errors the user can act on by correcting input or credentials.
    pub fn is_user_facing(&self) -> bool {
        matches!(
            self,
            AuthError::Validation(_) | AuthError::LoginFailed | AuthError::Server { .. }
        )
    }
}

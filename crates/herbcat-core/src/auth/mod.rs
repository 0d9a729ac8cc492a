//! Authentication module for managing user sessions and credentials.
//!
//! This module provides:
//! - `SessionManager`: login, registration, silent refresh and logout
//! - `CredentialStore`: the credential persisted in a durable or ephemeral scope
//! - `token::decode`: expiry and subject claims read from a bearer token
//! - `validation`: email and password checks run before any network call

pub mod credentials;
pub mod error;
pub mod identity;
pub mod session;
pub mod token;
pub mod validation;

pub use credentials::{Credential, CredentialStore, StorageScope};
pub use error::{AuthError, ValidationError};
pub use identity::IdentityApi;
pub use session::{
    AuthState, EndReason, SessionConfig, SessionEvent, SessionManager, SessionPhase,
    REFRESH_THRESHOLD,
};
pub use token::DecodedClaims;

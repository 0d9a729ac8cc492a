//! herbcat-core - session lifecycle and authenticated API access for the
//! herbcat catalog client.
//!
//! - `auth`: sign-in, silent refresh, logout, credential persistence
//! - `api`: the request pipeline every catalog call goes through
//! - `storage`: durable and ephemeral key/value backends
//! - `config`: on-disk configuration

pub mod api;
pub mod auth;
pub mod clock;
pub mod config;
pub mod storage;

#[cfg(test)]
mod testutil;

pub use api::{ApiClient, ApiError, ApiRequest, ReqwestTransport};
pub use auth::{
    AuthError, AuthState, Credential, CredentialStore, SessionEvent, SessionManager, StorageScope,
};
pub use config::Config;

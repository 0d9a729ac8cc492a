//! REST API client module for the herbcat catalog service.
//!
//! This module provides the `ApiClient` through which every domain request
//! (products, stores, producers, ...) is sent. It attaches the session's
//! bearer token and recovers once from an expired token by refreshing it.

pub mod client;
pub mod error;
pub mod transport;

pub use client::{ApiClient, ApiRequest};
pub use error::ApiError;
pub use transport::{HttpRequest, HttpResponse, Method, ReqwestTransport, Transport, TransportError};

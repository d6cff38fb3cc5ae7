//! # Tokenrelay Core
//!
//! Bearer-token API client that keeps a session alive across access-token
//! expiry.
//!
//! This crate provides:
//! - [`CredentialStore`] - access/refresh token persistence over a [`SecretStore`]
//! - [`RequestPipeline`] / [`ResponsePipeline`] - token injection and 401 classification
//! - [`RefreshCoordinator`] - at most one in-flight refresh, with queued replays
//! - [`ApiClient`] - the `request -> response` surface tying them together
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use tokenrelay_core::{ApiClient, ApiRequest, ClientConfig, create_store};
//!
//! let client = ApiClient::new(config, create_store(true).into())?;
//! match client.request(ApiRequest::get("/profile")).await {
//!     Ok(response) => println!("{}", response.body),
//!     Err(e) if e.is_session_expired() => println!("please sign in again"),
//!     Err(e) => return Err(e.into()),
//! }
//! ```

pub mod client;
pub mod clock;
pub mod config;
pub mod credentials;
pub mod error;
pub mod pipeline;
pub mod refresh;
pub mod request;
pub mod store;
pub mod transport;

// Re-export commonly used types at crate root
pub use client::{ApiClient, ApiClientBuilder};

pub use clock::{Clock, ManualClock, SystemClock};

pub use config::ClientConfig;

pub use credentials::{CredentialStore, Credentials};

pub use error::ClientError;

pub use pipeline::{Disposition, RequestPipeline, ResponsePipeline};

pub use refresh::{
    parse_token_response,
    IssuedTokens,
    RefreshCoordinator,
    RefreshError,
    RefreshSettings,
    SessionEvent,
};

pub use request::{ApiRequest, ApiResponse};

pub use store::{
    Secret,
    SecretStore,
    StoreError,
    MemoryStore,
    create_store,
};

#[cfg(feature = "keyring-store")]
pub use store::KeyringStore;

pub use transport::{ReqwestTransport, Transport, TransportError};

// Callers build requests with these.
pub use reqwest::{Method, StatusCode};

#![warn(clippy::all)]
#![allow(
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::new_without_default,
    clippy::return_self_not_must_use,
    clippy::uninlined_format_args
)]

//! Local credential broker for AI-CLI proxies.
//!
//! Acquires, persists, refreshes, and serves authentication material
//! for heterogeneous upstream providers: OAuth2 Authorization Code with
//! PKCE, OAuth2 Device Authorization, AWS SSO OIDC (Builder ID), bearer
//! API keys, and imports from third-party CLIs' on-disk stores. The
//! proxy process consumes this library through [`AuthManager`] and the
//! [`store::TokenStore`] contract; the `authbroker` binary wraps the
//! same surface for operators.

pub mod auth;
pub mod callback;
pub mod config;
pub mod error;
pub mod export;
pub mod import;
pub mod manager;
pub mod pkce;
pub mod providers;
pub mod store;

pub use auth::Auth;
pub use config::Config;
pub use error::{AuthError, Result};
pub use manager::AuthManager;

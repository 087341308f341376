//! sessiongate: per-session credentials for sandboxed agent jobs.
//!
//! Every session gets its own short-lived cluster identity. This crate
//! provisions and rotates that identity, verifies runner tokens against it,
//! derives request-scoped clients from user credentials, drives session
//! start/stop/continuation, and runs the signed-state OAuth flow that
//! attaches third-party credentials to a session.

pub mod api;
pub mod cluster;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod oauth;
pub mod provision;
pub mod resolver;
pub mod retry;
pub mod session;
pub mod store;
pub mod verify;

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};

/// URL-safe base64 that emits no padding and accepts it either way.
pub(crate) const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub use config::Config;
pub use error::{ClusterError, ConfigError, CredentialError, OAuthError, StateError};

//! Authentication module for OIDC tokens
//!
//! This module provides:
//! - PKCE and state generation for the authorization-code flow
//! - The JSON token cache keyed by client id
//! - The local redirect listener that captures the authorization code
//! - The token endpoint client and the `OidcAuthenticator` built on it

mod pkce;
mod token_store;
mod callback_server;
mod browser;
mod endpoint;
mod provider;

pub use token_store::{now_epoch, TokenRecord, TokenStore, EXPIRY_SAFETY_MARGIN_SECS};
pub use browser::{AuthorizationCodeSource, BrowserCodeSource};
pub use endpoint::{Grant, HttpTokenEndpoint, TokenEndpoint, TokenReply, TokenResponse};
pub use provider::{AccessTokenProvider, Capability, OidcAuthenticator, OidcSettings, REFRESH_BUFFER_SECS};

//! OidcAuthenticator - OAuth2/OIDC token lifecycle for one client id
//!
//! Manages:
//! - Token caching and local expiry checks (no network for a valid token)
//! - Refresh-token grants while the refresh token is still alive
//! - Full re-authentication (browser authorization code or password grant)
//! - One fallback to full authentication when the SSO session has ended

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;
use crate::Result;
use crate::config::AuthConfig;
use crate::error::Error;
use super::browser::{AuthorizationCodeSource, BrowserCodeSource};
use super::callback_server::redirect_uri;
use super::endpoint::{Grant, HttpTokenEndpoint, TokenEndpoint, TokenReply};
use super::pkce::{generate_state, PkcePair};
use super::token_store::{now_epoch, TokenRecord, TokenStore};

/// A refresh token must outlive "now" by more than this to be used
pub const REFRESH_BUFFER_SECS: i64 = 10;

/// Identity provider and client settings for one authenticator
#[derive(Debug, Clone)]
pub struct OidcSettings {
    pub server_url: String,
    pub realm: String,
    pub client_id: String,
    pub client_secret: String,
    pub scope: String,
    pub supported_clients: Vec<String>,
    pub callback_port: u16,
    pub login_timeout: Duration,
}

impl OidcSettings {
    pub fn from_config(auth: &AuthConfig, client_id: &str, client_secret: &str) -> Self {
        Self {
            server_url: auth.server_url.clone(),
            realm: auth.realm.clone(),
            client_id: client_id.to_string(),
            client_secret: client_secret.to_string(),
            scope: auth.scope.clone(),
            supported_clients: auth.supported_clients.clone(),
            callback_port: auth.callback_port,
            login_timeout: Duration::from_secs(auth.login_timeout_secs),
        }
    }

    fn protocol_url(&self, endpoint: &str) -> String {
        format!(
            "{}/auth/realms/{}/protocol/openid-connect/{}",
            self.server_url.trim_end_matches('/'),
            self.realm,
            endpoint
        )
    }

    pub fn authorization_endpoint(&self) -> String {
        self.protocol_url("auth")
    }

    pub fn token_endpoint(&self) -> String {
        self.protocol_url("token")
    }

    pub fn redirect_uri(&self) -> String {
        redirect_uri(self.callback_port)
    }
}

/// What the environment allows for a full login, chosen by the caller
#[derive(Clone)]
pub enum Capability {
    /// A browser can be opened; use the authorization-code flow
    Display(Arc<dyn AuthorizationCodeSource>),
    /// No display; fall back to the password grant
    Headless {
        username: Option<String>,
        password: Option<String>,
    },
}

impl Capability {
    /// Browser flow backed by the local redirect listener
    pub fn browser(settings: &OidcSettings) -> Self {
        Capability::Display(Arc::new(BrowserCodeSource::new(
            settings.callback_port,
            settings.login_timeout,
        )))
    }
}

enum LoginStrategy {
    Browser(Arc<dyn AuthorizationCodeSource>),
    Password { username: String, password: String },
}

/// Anything that can hand out a currently valid OIDC access token
#[async_trait]
pub trait AccessTokenProvider: Send + Sync {
    async fn access_token(&self) -> Result<String>;
}

/// OIDC authenticator for a single client id
pub struct OidcAuthenticator {
    settings: OidcSettings,
    strategy: LoginStrategy,
    endpoint: Arc<dyn TokenEndpoint>,
    store: TokenStore,
}

impl OidcAuthenticator {
    /// Create an authenticator; fails without any network call when the
    /// client is not allowed or a headless login has no credentials.
    pub fn new(
        settings: OidcSettings,
        capability: Capability,
        endpoint: Arc<dyn TokenEndpoint>,
        store: TokenStore,
    ) -> Result<Self> {
        if !settings.supported_clients.contains(&settings.client_id) {
            return Err(Error::Config(format!(
                "Client '{}' is not supported. Supported clients: {}",
                settings.client_id,
                settings.supported_clients.join(", ")
            )));
        }

        let strategy = match capability {
            Capability::Display(source) => LoginStrategy::Browser(source),
            Capability::Headless { username: Some(username), password: Some(password) } => {
                LoginStrategy::Password { username, password }
            }
            Capability::Headless { username: None, password: None } => {
                return Err(Error::Config(
                    "You must either have an active display session or provide username and password for authentication"
                        .to_string(),
                ));
            }
            Capability::Headless { .. } => {
                return Err(Error::Config(
                    "Both username and password are required for headless authentication".to_string(),
                ));
            }
        };

        Ok(Self { settings, strategy, endpoint, store })
    }

    /// Authenticator talking to the configured Keycloak realm over HTTP
    pub fn over_http(settings: OidcSettings, capability: Capability, store: TokenStore) -> Result<Self> {
        let endpoint = HttpTokenEndpoint::new(
            settings.token_endpoint(),
            settings.client_id.clone(),
            settings.client_secret.clone(),
        );
        Self::new(settings, capability, Arc::new(endpoint), store)
    }

    pub fn client_id(&self) -> &str {
        &self.settings.client_id
    }

    /// Get a valid token record, refreshing or re-authenticating as needed
    pub async fn get_valid_token(&self) -> Result<TokenRecord> {
        let cached = self.store.load(&self.settings.client_id)?;

        if let Some(record) = &cached {
            if !record.is_access_expired(now_epoch()) {
                tracing::debug!("Using cached access token for {}", self.settings.client_id);
                return Ok(record.clone());
            }
        }

        let record = self.authenticate(cached.as_ref()).await?;

        if record.is_access_expired(now_epoch()) {
            return Err(Error::Auth(format!(
                "Token endpoint issued an access token for {} that is already expired",
                self.settings.client_id
            )));
        }

        Ok(record)
    }

    /// Run one grant (plus at most one full-login retry) and persist the result
    async fn authenticate(&self, previous: Option<&TokenRecord>) -> Result<TokenRecord> {
        let grant = match previous {
            Some(record) if record.can_refresh(now_epoch(), REFRESH_BUFFER_SECS) => {
                tracing::info!("Access token expired, refreshing for {}", self.settings.client_id);
                Grant::RefreshToken { refresh_token: record.refresh_token.clone() }
            }
            _ => self.full_grant().await?,
        };

        let mut reply = self.endpoint.exchange(&grant).await?;

        if reply.is_session_inactive() {
            tracing::warn!("Identity provider session is no longer active, logging in again");
            let retry = self.full_grant().await?;
            reply = self.endpoint.exchange(&retry).await?;
        }

        let tokens = match reply {
            TokenReply::Issued(tokens) => tokens,
            TokenReply::Rejected { raw, .. } => return Err(Error::Auth(raw)),
        };

        let record = TokenRecord::from_lifetimes(
            tokens.access_token,
            tokens.refresh_token.unwrap_or_default(),
            tokens.expires_in,
            tokens.refresh_expires_in,
            now_epoch(),
        );
        self.store.save(&self.settings.client_id, &record)?;

        Ok(record)
    }

    async fn full_grant(&self) -> Result<Grant> {
        match &self.strategy {
            LoginStrategy::Password { username, password } => {
                tracing::info!("Requesting tokens with password grant for {}", username);
                Ok(Grant::Password {
                    username: username.clone(),
                    password: password.clone(),
                })
            }
            LoginStrategy::Browser(source) => {
                let pkce = PkcePair::generate();
                let state = generate_state();
                let url = self.build_auth_url(&pkce.challenge, &state)?;

                let code = source.authorization_code(&url, &state).await?;
                tracing::info!("Authorization code received, exchanging for tokens");

                Ok(Grant::AuthorizationCode {
                    code,
                    redirect_uri: self.settings.redirect_uri(),
                    code_verifier: pkce.verifier,
                })
            }
        }
    }

    fn build_auth_url(&self, code_challenge: &str, state: &str) -> Result<String> {
        let mut url = Url::parse(&self.settings.authorization_endpoint())
            .map_err(|e| Error::OAuth(format!("Invalid auth URL: {}", e)))?;

        url.query_pairs_mut()
            .append_pair("client_id", &self.settings.client_id)
            .append_pair("redirect_uri", &self.settings.redirect_uri())
            .append_pair("response_type", "code")
            .append_pair("scope", &self.settings.scope)
            .append_pair("state", state)
            .append_pair("access_type", "offline")
            .append_pair("code_challenge", code_challenge)
            .append_pair("code_challenge_method", "S256");

        Ok(url.to_string())
    }
}

#[async_trait]
impl AccessTokenProvider for OidcAuthenticator {
    async fn access_token(&self) -> Result<String> {
        Ok(self.get_valid_token().await?.access_token)
    }
}

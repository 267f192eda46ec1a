//! OIDC token endpoint
//!
//! Grants are POSTed form-encoded with HTTP basic auth (client id / secret).
//! Keycloak answers errors with a JSON body carrying `error` and
//! `error_description`; those are returned as [`TokenReply::Rejected`] so the
//! authenticator can decide whether a retry is warranted.

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::Value;
use crate::Result;
use crate::error::Error;

/// A token request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Grant {
    AuthorizationCode {
        code: String,
        redirect_uri: String,
        code_verifier: String,
    },
    RefreshToken {
        refresh_token: String,
    },
    Password {
        username: String,
        password: String,
    },
}

impl Grant {
    pub fn is_refresh(&self) -> bool {
        matches!(self, Grant::RefreshToken { .. })
    }

    fn form_fields(&self) -> Vec<(&'static str, &str)> {
        match self {
            Grant::AuthorizationCode { code, redirect_uri, code_verifier } => vec![
                ("grant_type", "authorization_code"),
                ("code", code.as_str()),
                ("redirect_uri", redirect_uri.as_str()),
                ("code_verifier", code_verifier.as_str()),
            ],
            Grant::RefreshToken { refresh_token } => vec![
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token.as_str()),
            ],
            Grant::Password { username, password } => vec![
                ("grant_type", "password"),
                ("username", username.as_str()),
                ("password", password.as_str()),
            ],
        }
    }
}

/// Successful token endpoint response
///
/// Lifetimes are relative seconds. Provider extras such as `scope` and
/// `session_state` are accepted but never persisted.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub refresh_expires_in: i64,
    #[serde(default)]
    pub scope: Option<String>,
    #[serde(default)]
    pub session_state: Option<String>,
}

/// Outcome of a grant
#[derive(Debug, Clone)]
pub enum TokenReply {
    Issued(TokenResponse),
    Rejected {
        error: String,
        description: Option<String>,
        raw: String,
    },
}

impl TokenReply {
    /// Whether the provider says the SSO session behind a refresh token is gone
    pub fn is_session_inactive(&self) -> bool {
        match self {
            TokenReply::Rejected { description: Some(description), .. } => description
                .to_ascii_lowercase()
                .contains("session not active"),
            _ => false,
        }
    }
}

/// Something that can turn a [`Grant`] into tokens
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange(&self, grant: &Grant) -> Result<TokenReply>;
}

/// Token endpoint reached over HTTP
#[derive(Clone)]
pub struct HttpTokenEndpoint {
    http_client: Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl HttpTokenEndpoint {
    pub fn new(token_url: String, client_id: String, client_secret: String) -> Self {
        Self {
            http_client: Client::new(),
            token_url,
            client_id,
            client_secret,
        }
    }
}

#[async_trait]
impl TokenEndpoint for HttpTokenEndpoint {
    async fn exchange(&self, grant: &Grant) -> Result<TokenReply> {
        let mut form = grant.form_fields();
        if grant.is_refresh() {
            form.push(("client_id", self.client_id.as_str()));
            form.push(("client_secret", self.client_secret.as_str()));
        }

        let response = self.http_client
            .post(&self.token_url)
            .basic_auth(&self.client_id, Some(&self.client_secret))
            .form(&form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        parse_reply(status.is_success(), body)
    }
}

fn parse_reply(success: bool, body: String) -> Result<TokenReply> {
    let value: Value = match serde_json::from_str(&body) {
        Ok(value) => value,
        Err(_) if !success => return Err(Error::Auth(body)),
        Err(e) => return Err(e.into()),
    };

    if let Some(error) = value.get("error").and_then(Value::as_str) {
        let description = value
            .get("error_description")
            .and_then(Value::as_str)
            .map(str::to_string);
        return Ok(TokenReply::Rejected {
            error: error.to_string(),
            description,
            raw: body,
        });
    }

    if !success {
        return Err(Error::Auth(body));
    }

    Ok(TokenReply::Issued(serde_json::from_value(value)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use base64::Engine;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    #[test]
    fn test_parse_issued_tokens() {
        let body = r#"{"access_token":"a","expires_in":300,"refresh_expires_in":1800,"refresh_token":"r","token_type":"Bearer","scope":"email profile","session_state":"s"}"#;
        match parse_reply(true, body.to_string()).unwrap() {
            TokenReply::Issued(tokens) => {
                assert_eq!(tokens.access_token, "a");
                assert_eq!(tokens.refresh_token.as_deref(), Some("r"));
                assert_eq!(tokens.refresh_expires_in, 1800);
            }
            other => panic!("unexpected reply {:?}", other),
        }
    }

    #[test]
    fn test_parse_session_not_active() {
        let body = r#"{"error":"invalid_grant","error_description":"Session not active"}"#;
        let reply = parse_reply(false, body.to_string()).unwrap();
        assert!(reply.is_session_inactive());
    }

    #[test]
    fn test_parse_other_rejection() {
        let body = r#"{"error":"invalid_client","error_description":"Invalid client credentials"}"#;
        let reply = parse_reply(false, body.to_string()).unwrap();
        assert!(!reply.is_session_inactive());
        assert!(matches!(reply, TokenReply::Rejected { ref error, .. } if error == "invalid_client"));
    }

    #[test]
    fn test_non_json_failure_is_auth_error() {
        let err = parse_reply(false, "<html>Bad Gateway</html>".to_string()).unwrap_err();
        assert!(matches!(err, Error::Auth(ref body) if body.contains("Bad Gateway")));
    }

    #[test]
    fn test_grant_form_fields() {
        let grant = Grant::Password { username: "alice".into(), password: "pw".into() };
        let fields = grant.form_fields();
        assert_eq!(fields[0], ("grant_type", "password"));
        assert!(fields.contains(&("username", "alice")));
        assert!(!grant.is_refresh());
    }

    /// One-shot HTTP server answering `status` with `body`; yields the raw request
    async fn serve_once(status: &'static str, body: &'static str) -> (String, oneshot::Receiver<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}", listener.local_addr().unwrap());
        let (tx, rx) = oneshot::channel();

        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request).to_string();
                if let Some(head_end) = text.find("\r\n\r\n") {
                    let length = text[..head_end]
                        .lines()
                        .find_map(|line| {
                            let (name, value) = line.split_once(':')?;
                            name.eq_ignore_ascii_case("content-length").then(|| value.trim().parse::<usize>().ok())?
                        })
                        .unwrap_or(0);
                    if request.len() >= head_end + 4 + length {
                        break;
                    }
                }
                if n == 0 {
                    break;
                }
            }

            let response = format!(
                "HTTP/1.1 {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                status,
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
            let _ = tx.send(String::from_utf8_lossy(&request).into_owned());
        });

        (url, rx)
    }

    fn form_pairs(request: &str) -> Vec<(String, String)> {
        let body = request.split("\r\n\r\n").nth(1).unwrap_or_default();
        url::form_urlencoded::parse(body.as_bytes()).into_owned().collect()
    }

    fn pair(key: &str, value: &str) -> (String, String) {
        (key.to_string(), value.to_string())
    }

    #[tokio::test]
    async fn test_http_exchange_posts_form_with_basic_auth() {
        let (url, request) = serve_once(
            "200 OK",
            r#"{"access_token":"a","expires_in":300,"refresh_expires_in":1800,"refresh_token":"r"}"#,
        )
        .await;
        let endpoint = HttpTokenEndpoint::new(url, "vm-cli".into(), "s3cret".into());

        let grant = Grant::Password { username: "alice".into(), password: "pw".into() };
        let reply = endpoint.exchange(&grant).await.unwrap();
        assert!(matches!(reply, TokenReply::Issued(ref tokens) if tokens.access_token == "a"));

        let request = request.await.unwrap();
        assert!(request.starts_with("POST "));
        let expected = format!(
            "authorization: basic {}",
            base64::engine::general_purpose::STANDARD.encode("vm-cli:s3cret")
        )
        .to_ascii_lowercase();
        assert!(request.to_ascii_lowercase().contains(&expected));

        let form = form_pairs(&request);
        assert!(form.contains(&pair("grant_type", "password")));
        assert!(form.contains(&pair("username", "alice")));
        assert!(form.contains(&pair("password", "pw")));
        assert!(!form.iter().any(|(key, _)| key == "client_id"));
    }

    #[tokio::test]
    async fn test_http_refresh_repeats_client_in_form() {
        let (url, request) = serve_once(
            "400 Bad Request",
            r#"{"error":"invalid_grant","error_description":"Session not active"}"#,
        )
        .await;
        let endpoint = HttpTokenEndpoint::new(url, "vm-cli".into(), "s3cret".into());

        let grant = Grant::RefreshToken { refresh_token: "r".into() };
        let reply = endpoint.exchange(&grant).await.unwrap();
        assert!(reply.is_session_inactive());

        let form = form_pairs(&request.await.unwrap());
        assert!(form.contains(&pair("grant_type", "refresh_token")));
        assert!(form.contains(&pair("refresh_token", "r")));
        assert!(form.contains(&pair("client_id", "vm-cli")));
        assert!(form.contains(&pair("client_secret", "s3cret")));
    }
}

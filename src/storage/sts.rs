//! AssumeRoleWithWebIdentity exchange
//!
//! The storage backend (MinIO) implements the STS call of the same name:
//! an OIDC access token goes in, temporary S3 credentials come out as XML.
//! Elements are matched by substring of their qualified name so any
//! namespace prefix is accepted.

use async_trait::async_trait;
use chrono::DateTime;
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use reqwest::Client;
use crate::Result;
use crate::error::Error;

const STS_VERSION: &str = "2011-06-15";

/// Credentials as returned by the STS endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssumedCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Timestamp string, e.g. `2025-01-01T00:00:00Z`
    pub expiration: String,
}

impl AssumedCredentials {
    pub fn expiration_epoch(&self) -> Result<i64> {
        parse_expiration(&self.expiration)
    }
}

/// Exchanges a web identity token for temporary storage credentials
#[async_trait]
pub trait WebIdentityExchange: Send + Sync {
    async fn assume_role(&self, web_identity_token: &str, duration_secs: u64) -> Result<AssumedCredentials>;
}

/// STS endpoint reached over HTTP
#[derive(Clone)]
pub struct HttpWebIdentityExchange {
    http_client: Client,
    endpoint: String,
}

impl HttpWebIdentityExchange {
    pub fn new(endpoint: String) -> Self {
        Self {
            http_client: Client::new(),
            endpoint,
        }
    }
}

#[async_trait]
impl WebIdentityExchange for HttpWebIdentityExchange {
    async fn assume_role(&self, web_identity_token: &str, duration_secs: u64) -> Result<AssumedCredentials> {
        let duration = duration_secs.to_string();
        let params = [
            ("Action", "AssumeRoleWithWebIdentity"),
            ("DurationSeconds", duration.as_str()),
            ("WebIdentityToken", web_identity_token),
            ("Version", STS_VERSION),
        ];

        tracing::info!("Requesting temporary storage credentials from {}", self.endpoint);
        let response = self.http_client
            .post(&self.endpoint)
            .query(&params)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(Error::Auth(body));
        }

        parse_assume_role_response(&body)
    }
}

#[derive(Clone, Copy)]
enum Field {
    AccessKeyId,
    SecretAccessKey,
    SessionToken,
    Expiration,
}

impl Field {
    fn matching(name: &str) -> Option<Self> {
        if name.contains("AccessKeyId") {
            Some(Field::AccessKeyId)
        } else if name.contains("SecretAccessKey") {
            Some(Field::SecretAccessKey)
        } else if name.contains("SessionToken") {
            Some(Field::SessionToken)
        } else if name.contains("Expiration") {
            Some(Field::Expiration)
        } else {
            None
        }
    }
}

/// Pull the four credential fields out of an STS XML response
pub fn parse_assume_role_response(xml: &str) -> Result<AssumedCredentials> {
    let mut reader = Reader::from_str(xml);
    reader.config_mut().trim_text(true);

    let mut access_key_id = None;
    let mut secret_access_key = None;
    let mut session_token = None;
    let mut expiration = None;
    let mut current = None;

    loop {
        match reader.read_event() {
            Ok(Event::Start(element)) => {
                let name = String::from_utf8_lossy(element.name().as_ref()).into_owned();
                current = Field::matching(&name);
            }
            Ok(Event::Text(text)) => {
                let Some(field) = current else { continue };
                let value = text
                    .unescape()
                    .map_err(|e| Error::Xml(e.to_string()))?
                    .into_owned();
                let slot = match field {
                    Field::AccessKeyId => &mut access_key_id,
                    Field::SecretAccessKey => &mut secret_access_key,
                    Field::SessionToken => &mut session_token,
                    Field::Expiration => &mut expiration,
                };
                slot.get_or_insert(value);
            }
            Ok(Event::End(_)) => current = None,
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => return Err(Error::Xml(e.to_string())),
        }
    }

    let missing = |name: &str| Error::Auth(format!("STS response is missing {}", name));
    Ok(AssumedCredentials {
        access_key_id: access_key_id.ok_or_else(|| missing("AccessKeyId"))?,
        secret_access_key: secret_access_key.ok_or_else(|| missing("SecretAccessKey"))?,
        session_token: session_token.ok_or_else(|| missing("SessionToken"))?,
        expiration: expiration.ok_or_else(|| missing("Expiration"))?,
    })
}

/// Convert an STS expiration timestamp to epoch seconds
pub fn parse_expiration(raw: &str) -> Result<i64> {
    let raw = raw.trim();
    DateTime::parse_from_rfc3339(raw)
        .or_else(|_| DateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%z"))
        .map(|dt| dt.timestamp())
        .map_err(|e| Error::Auth(format!("Invalid credential expiration '{}': {}", raw, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;
    use tokio::sync::oneshot;

    const RESPONSE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<AssumeRoleWithWebIdentityResponse xmlns="https://sts.amazonaws.com/doc/2011-06-15/">
  <AssumeRoleWithWebIdentityResult>
    <AssumedRoleUser><Arn></Arn><AssumeRoleId></AssumeRoleId></AssumedRoleUser>
    <Credentials>
      <AccessKeyId>Y4RJU1RNFGK48LGO9I2S</AccessKeyId>
      <SecretAccessKey>sYLRKS1Z7hSjluf6gEbb9066hnx315wHTiACPAjg</SecretAccessKey>
      <Expiration>2019-08-08T20:26:12Z</Expiration>
      <SessionToken>eyJhbGciOiJIUzUxMiIsInR5cCI6IkpXVCJ9.eyJhY2Nlc3NLZXkiOiJZNFJKVTFSTkZHSzQ4TEdPOUkyUyJ9.a&amp;b</SessionToken>
    </Credentials>
    <SubjectFromWebIdentityToken>03b8d65a</SubjectFromWebIdentityToken>
  </AssumeRoleWithWebIdentityResult>
  <ResponseMetadata><RequestId>15B283A9F8A4B9A0</RequestId></ResponseMetadata>
</AssumeRoleWithWebIdentityResponse>"#;

    #[test]
    fn test_parse_response() {
        let creds = parse_assume_role_response(RESPONSE).unwrap();
        assert_eq!(creds.access_key_id, "Y4RJU1RNFGK48LGO9I2S");
        assert_eq!(creds.secret_access_key, "sYLRKS1Z7hSjluf6gEbb9066hnx315wHTiACPAjg");
        assert!(creds.session_token.ends_with(".a&b"));
        assert_eq!(creds.expiration, "2019-08-08T20:26:12Z");
        assert_eq!(creds.expiration_epoch().unwrap(), 1_565_295_972);
    }

    #[test]
    fn test_parse_prefixed_tags() {
        let xml = r#"<sts:Response xmlns:sts="urn:x"><sts:Credentials>
            <sts:AccessKeyId>A</sts:AccessKeyId>
            <sts:SecretAccessKey>S</sts:SecretAccessKey>
            <sts:SessionToken>T</sts:SessionToken>
            <sts:Expiration>2030-01-01T00:00:00+00:00</sts:Expiration>
        </sts:Credentials></sts:Response>"#;

        let creds = parse_assume_role_response(xml).unwrap();
        assert_eq!(creds.access_key_id, "A");
        assert_eq!(creds.session_token, "T");
        assert_eq!(creds.expiration_epoch().unwrap(), 1_893_456_000);
    }

    #[test]
    fn test_missing_field_is_auth_error() {
        let xml = "<Credentials><AccessKeyId>A</AccessKeyId><SecretAccessKey>S</SecretAccessKey></Credentials>";
        let err = parse_assume_role_response(xml).unwrap_err();
        assert!(matches!(err, Error::Auth(ref msg) if msg.contains("SessionToken")));
    }

    #[test]
    fn test_expiration_formats() {
        assert_eq!(parse_expiration("1970-01-01T00:01:00Z").unwrap(), 60);
        assert_eq!(parse_expiration("1970-01-01T01:00:00+0100").unwrap(), 0);
        assert_eq!(parse_expiration("2019-08-08T20:26:12.123Z").unwrap(), 1_565_295_972);
        assert!(parse_expiration("tomorrow").is_err());
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

    #[tokio::test]
    async fn test_exchange_sends_query_and_parses_reply() {
        let (url, request) = serve_once("200 OK", RESPONSE).await;
        let exchange = HttpWebIdentityExchange::new(url);

        let creds = exchange.assume_role("oidc-token", 3600).await.unwrap();
        assert_eq!(creds.access_key_id, "Y4RJU1RNFGK48LGO9I2S");

        let request = request.await.unwrap();
        let target = request.split_whitespace().nth(1).unwrap();
        assert!(request.starts_with("POST "));
        let sent = url::Url::parse(&format!("http://localhost{}", target)).unwrap();
        let pairs: Vec<(String, String)> = sent.query_pairs().into_owned().collect();
        for (key, value) in [
            ("Action", "AssumeRoleWithWebIdentity"),
            ("DurationSeconds", "3600"),
            ("WebIdentityToken", "oidc-token"),
            ("Version", "2011-06-15"),
        ] {
            assert!(pairs.contains(&(key.to_string(), value.to_string())), "missing {}", key);
        }
    }

    #[tokio::test]
    async fn test_exchange_rejection_carries_raw_body() {
        const DENIED: &str = "<ErrorResponse><Error><Code>AccessDenied</Code></Error></ErrorResponse>";
        let (url, _request) = serve_once("403 Forbidden", DENIED).await;
        let exchange = HttpWebIdentityExchange::new(url);

        let err = exchange.assume_role("oidc-token", 3600).await.unwrap_err();
        assert!(matches!(err, Error::Auth(ref body) if body == DENIED));
    }
}

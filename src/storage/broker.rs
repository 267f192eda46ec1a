//! Storage credential broker
//!
//! Hands out temporary storage credentials for one endpoint, deriving fresh
//! ones from an OIDC access token when the cached set has expired.

use std::sync::Arc;
use crate::Result;
use crate::auth::{now_epoch, AccessTokenProvider, EXPIRY_SAFETY_MARGIN_SECS};
use super::credentials_file::{section_key, StorageCredentialRecord, StorageCredentialStore};
use super::sts::{HttpWebIdentityExchange, WebIdentityExchange};

pub struct StorageCredentialBroker {
    section: String,
    duration_secs: u64,
    store: StorageCredentialStore,
    tokens: Arc<dyn AccessTokenProvider>,
    exchange: Arc<dyn WebIdentityExchange>,
}

impl StorageCredentialBroker {
    pub fn new(
        endpoint: &str,
        duration_secs: u64,
        store: StorageCredentialStore,
        tokens: Arc<dyn AccessTokenProvider>,
        exchange: Arc<dyn WebIdentityExchange>,
    ) -> Result<Self> {
        Ok(Self {
            section: section_key(endpoint)?,
            duration_secs,
            store,
            tokens,
            exchange,
        })
    }

    /// Broker talking to the STS API of the storage endpoint itself
    pub fn over_http(
        endpoint: &str,
        duration_secs: u64,
        store: StorageCredentialStore,
        tokens: Arc<dyn AccessTokenProvider>,
    ) -> Result<Self> {
        let exchange = Arc::new(HttpWebIdentityExchange::new(endpoint.to_string()));
        Self::new(endpoint, duration_secs, store, tokens, exchange)
    }

    /// Credentials file section this broker reads and writes
    pub fn section(&self) -> &str {
        &self.section
    }

    /// Cached credentials if still valid, otherwise freshly assumed ones
    ///
    /// A failed exchange is not retried and leaves the cache untouched.
    pub async fn get_valid_credentials(&self) -> Result<StorageCredentialRecord> {
        if let Some(cached) = self.store.load(&self.section)? {
            if !cached.is_expired(now_epoch()) {
                tracing::debug!("Using cached storage credentials for [{}]", self.section);
                return Ok(cached);
            }
            tracing::info!("Storage credentials for [{}] expired", self.section);
        }

        let access_token = self.tokens.access_token().await?;
        let assumed = self.exchange
            .assume_role(&access_token, self.duration_secs)
            .await?;

        let record = StorageCredentialRecord {
            section: self.section.clone(),
            expiry_epoch: assumed.expiration_epoch()? - EXPIRY_SAFETY_MARGIN_SECS,
            access_key_id: assumed.access_key_id,
            secret_access_key: assumed.secret_access_key,
            session_token: assumed.session_token,
        };
        self.store.save(&record)?;

        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::storage::sts::AssumedCredentials;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    const ENDPOINT: &str = "https://storage.example.org";

    #[derive(Default)]
    struct CountingTokens {
        calls: AtomicU32,
    }

    #[async_trait]
    impl AccessTokenProvider for CountingTokens {
        async fn access_token(&self) -> Result<String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok("oidc-access".to_string())
        }
    }

    struct FakeExchange {
        reply: Result<AssumedCredentials>,
        calls: AtomicU32,
        seen: Mutex<Vec<(String, u64)>>,
    }

    impl FakeExchange {
        fn returning(reply: Result<AssumedCredentials>) -> Self {
            Self {
                reply,
                calls: AtomicU32::new(0),
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl WebIdentityExchange for FakeExchange {
        async fn assume_role(&self, token: &str, duration_secs: u64) -> Result<AssumedCredentials> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.seen.lock().unwrap().push((token.to_string(), duration_secs));
            match &self.reply {
                Ok(creds) => Ok(creds.clone()),
                Err(e) => Err(Error::Auth(e.to_string())),
            }
        }
    }

    fn assumed() -> AssumedCredentials {
        AssumedCredentials {
            access_key_id: "AKIA-NEW".to_string(),
            secret_access_key: "secret-new".to_string(),
            session_token: "session-new".to_string(),
            expiration: "2099-01-01T00:00:00Z".to_string(),
        }
    }

    fn broker(
        tmp: &TempDir,
        tokens: Arc<CountingTokens>,
        exchange: Arc<FakeExchange>,
    ) -> StorageCredentialBroker {
        let store = StorageCredentialStore::new(tmp.path().join("credentials"));
        StorageCredentialBroker::new(ENDPOINT, 3600, store, tokens, exchange).unwrap()
    }

    fn cached(expiry_epoch: i64) -> StorageCredentialRecord {
        StorageCredentialRecord {
            section: "storage.example.org".to_string(),
            access_key_id: "AKIA-OLD".to_string(),
            secret_access_key: "secret-old".to_string(),
            session_token: "session-old".to_string(),
            expiry_epoch,
        }
    }

    #[tokio::test]
    async fn test_valid_cache_skips_network() {
        let tmp = TempDir::new().unwrap();
        let tokens = Arc::new(CountingTokens::default());
        let exchange = Arc::new(FakeExchange::returning(Ok(assumed())));
        let broker = broker(&tmp, tokens.clone(), exchange.clone());

        let record = cached(now_epoch() + 600);
        StorageCredentialStore::new(tmp.path().join("credentials")).save(&record).unwrap();

        assert_eq!(broker.get_valid_credentials().await.unwrap(), record);
        assert_eq!(tokens.calls.load(Ordering::SeqCst), 0);
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_missing_cache_assumes_and_persists() {
        let tmp = TempDir::new().unwrap();
        let tokens = Arc::new(CountingTokens::default());
        let exchange = Arc::new(FakeExchange::returning(Ok(assumed())));
        let broker = broker(&tmp, tokens.clone(), exchange.clone());

        let record = broker.get_valid_credentials().await.unwrap();
        assert_eq!(record.section, "storage.example.org");
        assert_eq!(record.access_key_id, "AKIA-NEW");
        assert_eq!(record.expiry_epoch, 4_070_908_800 - EXPIRY_SAFETY_MARGIN_SECS);

        assert_eq!(tokens.calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            exchange.seen.lock().unwrap().as_slice(),
            &[("oidc-access".to_string(), 3600)]
        );

        let stored = StorageCredentialStore::new(tmp.path().join("credentials"))
            .load("storage.example.org")
            .unwrap();
        assert_eq!(stored, Some(record));
    }

    #[tokio::test]
    async fn test_expired_cache_is_replaced() {
        let tmp = TempDir::new().unwrap();
        let tokens = Arc::new(CountingTokens::default());
        let exchange = Arc::new(FakeExchange::returning(Ok(assumed())));
        let broker = broker(&tmp, tokens.clone(), exchange.clone());

        StorageCredentialStore::new(tmp.path().join("credentials"))
            .save(&cached(now_epoch() - 1))
            .unwrap();

        let record = broker.get_valid_credentials().await.unwrap();
        assert_eq!(record.access_key_id, "AKIA-NEW");
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exchange_failure_is_not_retried() {
        let tmp = TempDir::new().unwrap();
        let tokens = Arc::new(CountingTokens::default());
        let exchange = Arc::new(FakeExchange::returning(Err(Error::Auth(
            "<Error><Code>AccessDenied</Code></Error>".to_string(),
        ))));
        let broker = broker(&tmp, tokens.clone(), exchange.clone());

        let err = broker.get_valid_credentials().await.unwrap_err();
        assert!(matches!(err, Error::Auth(ref body) if body.contains("AccessDenied")));
        assert_eq!(exchange.calls.load(Ordering::SeqCst), 1);
        assert!(!tmp.path().join("credentials").exists());
    }

    #[test]
    fn test_invalid_endpoint_is_rejected() {
        let tmp = TempDir::new().unwrap();
        let store = StorageCredentialStore::new(tmp.path().join("credentials"));
        let result = StorageCredentialBroker::new(
            "storage",
            3600,
            store,
            Arc::new(CountingTokens::default()),
            Arc::new(FakeExchange::returning(Ok(assumed()))),
        );
        assert!(matches!(result, Err(Error::Config(_))));
    }
}

//! AWS-CLI style credentials file
//!
//! Temporary storage credentials live in `~/.aws/credentials`, one INI
//! section per storage endpoint host, so `aws --endpoint-url ...` and other
//! S3 tooling can pick them up. Saving only touches our own keys in our own
//! section; everything else in the file is kept.

use ini::Ini;
use std::path::{Path, PathBuf};
use url::Url;
use crate::Result;
use crate::error::Error;

const ACCESS_KEY_ID: &str = "aws_access_key_id";
const SECRET_ACCESS_KEY: &str = "aws_secret_access_key";
const SESSION_TOKEN: &str = "aws_session_token";
const EXPIRY: &str = "expiry";

/// Temporary credentials for one storage endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StorageCredentialRecord {
    /// Section name, the endpoint's `host[:port]`
    pub section: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    /// Absolute expiry in epoch seconds, safety margin applied
    pub expiry_epoch: i64,
}

impl StorageCredentialRecord {
    pub fn is_expired(&self, now: i64) -> bool {
        self.expiry_epoch < now
    }
}

/// Section key for a storage endpoint URL
pub fn section_key(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| Error::Config(format!("Invalid storage URL '{}': {}", endpoint, e)))?;
    let host = url
        .host_str()
        .ok_or_else(|| Error::Config(format!("Storage URL '{}' has no host", endpoint)))?;

    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

/// Older files store the expiry as a float ("1700000000.0")
fn parse_expiry(raw: &str) -> Option<i64> {
    let raw = raw.trim();
    raw.parse::<i64>()
        .ok()
        .or_else(|| raw.parse::<f64>().ok().map(|secs| secs as i64))
}

fn record_from_section(section: &str, props: &ini::Properties) -> Option<StorageCredentialRecord> {
    Some(StorageCredentialRecord {
        section: section.to_string(),
        access_key_id: props.get(ACCESS_KEY_ID)?.to_string(),
        secret_access_key: props.get(SECRET_ACCESS_KEY)?.to_string(),
        session_token: props.get(SESSION_TOKEN)?.to_string(),
        expiry_epoch: parse_expiry(props.get(EXPIRY)?)?,
    })
}

/// File-backed storage credential cache keyed by endpoint section
#[derive(Debug, Clone)]
pub struct StorageCredentialStore {
    path: PathBuf,
}

impl StorageCredentialStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// `~/.aws/credentials`
    pub fn default_location() -> Self {
        Self::new(crate::config::aws_dir().join("credentials"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the record stored under `section`
    ///
    /// A missing or unparsable file, or a section lacking any of the four
    /// fields, yields `None`.
    pub fn load(&self, section: &str) -> Result<Option<StorageCredentialRecord>> {
        let ini = self.read()?;
        let Some(props) = ini.section(Some(section)) else {
            return Ok(None);
        };

        Ok(record_from_section(section, props))
    }

    /// Merge `record` into the file under its section
    pub fn save(&self, record: &StorageCredentialRecord) -> Result<()> {
        if let Some(dir) = self.path.parent() {
            std::fs::create_dir_all(dir)?;

            // The AWS CLI expects a config file next to the credentials.
            let aws_config = dir.join("config");
            if !aws_config.exists() {
                std::fs::File::create(&aws_config)?;
            }
        }

        let mut ini = self.read()?;
        ini.with_section(Some(record.section.as_str()))
            .set(ACCESS_KEY_ID, record.access_key_id.as_str())
            .set(SECRET_ACCESS_KEY, record.secret_access_key.as_str())
            .set(SESSION_TOKEN, record.session_token.as_str())
            .set(EXPIRY, record.expiry_epoch.to_string());
        ini.write_to_file(&self.path)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&self.path, std::fs::Permissions::from_mode(0o600))?;
        }

        tracing::debug!("Saved storage credentials for [{}] to {:?}", record.section, self.path);
        Ok(())
    }

    fn read(&self) -> Result<Ini> {
        if !self.path.exists() {
            return Ok(Ini::new());
        }

        let content = match String::from_utf8(std::fs::read(&self.path)?) {
            Ok(content) => content,
            Err(e) => {
                tracing::warn!("Ignoring unreadable credentials file {:?}: {}", self.path, e);
                return Ok(Ini::new());
            }
        };
        match Ini::load_from_str(&content) {
            Ok(ini) => Ok(ini),
            Err(e) => {
                tracing::warn!("Ignoring malformed credentials file {:?}: {}", self.path, e);
                Ok(Ini::new())
            }
        }
    }
}

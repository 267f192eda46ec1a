//! Object storage credentials
//!
//! Temporary S3 credentials are derived from the OIDC session through the
//! storage endpoint's STS API and cached in the AWS CLI credentials file.

mod credentials_file;
mod sts;
mod broker;

pub use credentials_file::{section_key, StorageCredentialRecord, StorageCredentialStore};
pub use sts::{
    parse_assume_role_response, parse_expiration, AssumedCredentials, HttpWebIdentityExchange,
    WebIdentityExchange,
};
pub use broker::StorageCredentialBroker;

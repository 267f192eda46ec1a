//! muon - client for the VM and object-storage backend
//!
//! This library provides OIDC login with a persistent token cache,
//! temporary storage credentials derived from the login, and tracking of
//! long-running VM tasks.

pub mod auth;
pub mod config;
pub mod error;
pub mod retry;
pub mod storage;
pub mod ui;
pub mod vm;

pub use error::{Error, Result};

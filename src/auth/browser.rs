//! Interactive authorization-code capture

use async_trait::async_trait;
use std::time::Duration;
use crate::Result;
use super::callback_server::{bind, wait_for_callback};

/// Produces an authorization code for a prepared authorization URL
#[async_trait]
pub trait AuthorizationCodeSource: Send + Sync {
    async fn authorization_code(&self, authorization_url: &str, state: &str) -> Result<String>;
}

/// Opens the system browser and waits on the local redirect listener
#[derive(Debug, Clone)]
pub struct BrowserCodeSource {
    port: u16,
    timeout: Duration,
}

impl BrowserCodeSource {
    pub fn new(port: u16, timeout: Duration) -> Self {
        Self { port, timeout }
    }
}

#[async_trait]
impl AuthorizationCodeSource for BrowserCodeSource {
    async fn authorization_code(&self, authorization_url: &str, state: &str) -> Result<String> {
        // Bind before opening the browser so a fast redirect cannot miss us.
        let listener = bind(self.port).await?;

        println!("\nOpening browser for authentication...\n");
        println!("If the browser doesn't open, visit this URL:\n{}\n", authorization_url);

        if let Err(e) = open::that(authorization_url) {
            tracing::warn!("Failed to open browser: {}", e);
        }

        println!("Waiting for authorization (Ctrl+C to cancel)...");
        let result = wait_for_callback(listener, Some(state), self.timeout).await?;
        Ok(result.code)
    }
}

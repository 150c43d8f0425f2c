//! Kiln HTTP Client
//!
//! A small, type-safe HTTP client for the control-plane API that hands out
//! build jobs and records their progress.
//!
//! # Example
//!
//! ```no_run
//! use kiln_client::ControlPlaneClient;
//!
//! #[tokio::main]
//! async fn main() -> kiln_client::Result<()> {
//!     let client = ControlPlaneClient::new("http://localhost:3080", "executor-token");
//!
//!     if let Some(job) = client.dequeue("default").await? {
//!         println!("Dequeued build {}", job.id);
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
mod builds;
mod files;
mod tasks;

pub use error::{ClientError, Result};

use reqwest::{Client, RequestBuilder};
use serde::de::DeserializeOwned;

/// HTTP client for the control-plane executor API
///
/// Methods are grouped by resource:
/// - Queue and build lifecycle (dequeue, update, active listing, logs)
/// - Task creation, updates and listing
/// - File store downloads
///
/// Cloning is cheap; the underlying connection pool is shared.
#[derive(Debug, Clone)]
pub struct ControlPlaneClient {
    /// Base URL of the control plane (e.g., "http://localhost:3080")
    base_url: String,
    /// Token sent with every request
    token: String,
    /// HTTP client instance
    client: Client,
}

impl ControlPlaneClient {
    /// Create a new control-plane client
    ///
    /// # Arguments
    /// * `base_url` - The base URL of the control plane
    /// * `token` - The executor token used for queue-level calls
    ///
    /// # Example
    /// ```
    /// use kiln_client::ControlPlaneClient;
    ///
    /// let client = ControlPlaneClient::new("http://localhost:3080", "secret");
    /// ```
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Self {
        Self::with_client(base_url, token, Client::new())
    }

    /// Create a new client with a custom HTTP client
    ///
    /// This allows configuring timeouts, proxies, TLS settings, etc.
    pub fn with_client(base_url: impl Into<String>, token: impl Into<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token: token.into(),
            client,
        }
    }

    /// Returns a client that authenticates with a job's own access token
    ///
    /// Per-build calls (task updates, logs, files) must use the job token so
    /// the control plane can scope them to that build.
    pub fn for_job(&self, access_token: &str) -> Self {
        Self {
            base_url: self.base_url.clone(),
            token: access_token.to_string(),
            client: self.client.clone(),
        }
    }

    /// Get the base URL of the control plane
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorized(&self, builder: RequestBuilder) -> RequestBuilder {
        if self.token.is_empty() {
            builder
        } else {
            builder.header("Authorization", format!("token {}", self.token))
        }
    }

    // =============================================================================
    // Response Handlers
    // =============================================================================

    /// Handle an API response and deserialize JSON
    async fn handle_response<T: DeserializeOwned>(&self, response: reqwest::Response) -> Result<T> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        response
            .json()
            .await
            .map_err(|e| ClientError::ParseError(format!("Failed to parse JSON response: {}", e)))
    }

    /// Handle an API response that returns no content
    async fn handle_empty_response(&self, response: reqwest::Response) -> Result<()> {
        let status = response.status();

        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(())
    }
}

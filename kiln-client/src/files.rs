//! File store endpoints

use crate::ControlPlaneClient;
use crate::error::{ClientError, Result};

impl ControlPlaneClient {
    /// Download a file from the control plane's file store
    ///
    /// # Arguments
    /// * `bucket` - Bucket the file lives in
    /// * `key` - Object key within the bucket
    pub async fn get_file(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        let url = self.url(&format!("/.executors/files/{}/{}", bucket, key));
        let response = self.authorized(self.client.get(&url)).send().await?;

        let status = response.status();
        if status.as_u16() == 404 {
            return Err(ClientError::NotFound(format!("{}/{}", bucket, key)));
        }
        if !status.is_success() {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ClientError::api_error(status.as_u16(), error_text));
        }

        Ok(response.bytes().await?.to_vec())
    }
}

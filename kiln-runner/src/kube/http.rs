//! REST implementation of [`KubeApi`]

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::{KubeApi, KubeError, WatchEvent};
use crate::config::KubernetesOptions;

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";

/// Buffered watch events per stream
const WATCH_BUFFER: usize = 16;

/// Kubernetes REST client
#[derive(Debug, Clone)]
pub struct KubeClient {
    base_url: String,
    token: Option<String>,
    client: Client,
}

impl KubeClient {
    /// Creates a client for an explicit API server
    pub fn new(base_url: impl Into<String>, token: Option<String>, client: Client) -> Self {
        let base_url = base_url.into();
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            client,
        }
    }

    /// Creates a client from configuration
    ///
    /// Uses the configured API URL and token when set, in-cluster service
    /// account discovery otherwise.
    pub fn from_options(options: &KubernetesOptions) -> Result<Self, KubeError> {
        match &options.api_url {
            Some(url) => Ok(Self::new(url.clone(), options.token.clone(), Client::new())),
            None => Self::in_cluster(),
        }
    }

    /// Creates a client from the pod's service account
    pub fn in_cluster() -> Result<Self, KubeError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| KubeError::Config("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = std::fs::read_to_string(format!("{}/token", SERVICE_ACCOUNT_DIR))
            .map_err(|e| KubeError::Config(format!("reading service account token: {}", e)))?;
        let ca = std::fs::read(format!("{}/ca.crt", SERVICE_ACCOUNT_DIR))
            .map_err(|e| KubeError::Config(format!("reading service account CA: {}", e)))?;
        let certificate = reqwest::Certificate::from_pem(&ca)?;

        let client = Client::builder().add_root_certificate(certificate).build()?;

        Ok(Self::new(
            format!("https://{}:{}", host, port),
            Some(token.trim().to_string()),
            client,
        ))
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, format!("{}{}", self.base_url, path));
        match &self.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response, KubeError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let message = response
            .text()
            .await
            .unwrap_or_else(|_| "Unknown error".to_string());
        Err(KubeError::Api {
            status: status.as_u16(),
            message,
        })
    }

    async fn create(&self, path: &str, body: &Value) -> Result<(), KubeError> {
        let response = self.request(Method::POST, path).json(body).send().await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn delete(&self, path: &str) -> Result<(), KubeError> {
        let response = self
            .request(Method::DELETE, path)
            .query(&[("propagationPolicy", "Background")])
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}

#[async_trait]
impl KubeApi for KubeClient {
    async fn create_job(&self, namespace: &str, job: &Value) -> Result<(), KubeError> {
        self.create(&format!("/apis/batch/v1/namespaces/{}/jobs", namespace), job)
            .await
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.delete(&format!(
            "/apis/batch/v1/namespaces/{}/jobs/{}",
            namespace, name
        ))
        .await
    }

    async fn create_secret(&self, namespace: &str, secret: &Value) -> Result<(), KubeError> {
        self.create(&format!("/api/v1/namespaces/{}/secrets", namespace), secret)
            .await
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.delete(&format!("/api/v1/namespaces/{}/secrets/{}", namespace, name))
            .await
    }

    async fn create_pvc(&self, namespace: &str, pvc: &Value) -> Result<(), KubeError> {
        self.create(
            &format!("/api/v1/namespaces/{}/persistentvolumeclaims", namespace),
            pvc,
        )
        .await
    }

    async fn delete_pvc(&self, namespace: &str, name: &str) -> Result<(), KubeError> {
        self.delete(&format!(
            "/api/v1/namespaces/{}/persistentvolumeclaims/{}",
            namespace, name
        ))
        .await
    }

    async fn watch_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<mpsc::Receiver<WatchEvent>, KubeError> {
        let response = self
            .request(Method::GET, &format!("/api/v1/namespaces/{}/pods", namespace))
            .query(&[("labelSelector", label_selector), ("watch", "true")])
            .send()
            .await?;
        let mut response = Self::check(response).await?;

        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let selector = label_selector.to_string();

        tokio::spawn(async move {
            let mut buffer: Vec<u8> = Vec::new();

            loop {
                let chunk = match response.chunk().await {
                    Ok(Some(chunk)) => chunk,
                    Ok(None) => break,
                    Err(e) => {
                        warn!("Pod watch {} broke: {}", selector, e);
                        break;
                    }
                };
                buffer.extend_from_slice(&chunk);

                while let Some(newline) = buffer.iter().position(|b| *b == b'\n') {
                    let line: Vec<u8> = buffer.drain(..=newline).collect();
                    let line = line.trim_ascii();
                    if line.is_empty() {
                        continue;
                    }

                    match serde_json::from_slice::<WatchEvent>(line) {
                        Ok(event) => {
                            if tx.send(event).await.is_err() {
                                debug!("Pod watch {} receiver dropped", selector);
                                return;
                            }
                        }
                        Err(e) => warn!("Skipping undecodable watch event: {}", e),
                    }
                }
            }
        });

        Ok(rx)
    }

    async fn pod_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: &str,
    ) -> Result<String, KubeError> {
        let response = self
            .request(
                Method::GET,
                &format!("/api/v1/namespaces/{}/pods/{}/log", namespace, pod),
            )
            .query(&[("container", container)])
            .send()
            .await?;

        Ok(Self::check(response).await?.text().await?)
    }
}

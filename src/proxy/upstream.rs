//! Upstream Kubernetes API client.
//!
//! All proxied traffic leaves through this client. Requests are forwarded
//! with their original paths; the client authenticates to the API server
//! with its own TLS client certificate, so inbound Authorization headers
//! are stripped rather than forwarded.

use std::collections::BTreeMap;

use async_trait::async_trait;
use reqwest::{Certificate, Identity, Method, Url};
use thiserror::Error;

use crate::config::UpstreamConfig;
use crate::workflow::activities::KubeClient;
use crate::workflow::{ActivityError, KubeRequest, KubeResponse, KubeStatus};

/// Headers never forwarded upstream: hop-by-hop headers plus the inbound
/// credentials the proxy replaces with its own identity.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "connection",
    "keep-alive",
    "proxy-connection",
    "transfer-encoding",
    "upgrade",
    "content-length",
];

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("invalid upstream configuration: {0}")]
    Config(String),

    #[error("upstream request failed: {0}")]
    Transport(String),
}

fn is_stripped(name: &str) -> bool {
    STRIPPED_HEADERS.contains(&name.to_ascii_lowercase().as_str())
}

/// Shared transport to the upstream API server.
pub struct UpstreamClient {
    base: Url,
    client: reqwest::Client,
}

impl UpstreamClient {
    pub fn new(config: &UpstreamConfig) -> Result<Self, UpstreamError> {
        let base = Url::parse(&config.server)
            .map_err(|e| UpstreamError::Config(format!("invalid upstream url: {e}")))?;

        let mut builder = reqwest::Client::builder().use_rustls_tls();
        if let Some(path) = &config.ca_cert {
            let pem = std::fs::read(path)
                .map_err(|e| UpstreamError::Config(format!("unreadable ca cert {path:?}: {e}")))?;
            let cert = Certificate::from_pem(&pem)
                .map_err(|e| UpstreamError::Config(format!("invalid ca cert {path:?}: {e}")))?;
            builder = builder.add_root_certificate(cert);
        }
        if let (Some(cert_path), Some(key_path)) = (&config.client_cert, &config.client_key) {
            let mut pem = std::fs::read(cert_path).map_err(|e| {
                UpstreamError::Config(format!("unreadable client cert {cert_path:?}: {e}"))
            })?;
            let key = std::fs::read(key_path).map_err(|e| {
                UpstreamError::Config(format!("unreadable client key {key_path:?}: {e}"))
            })?;
            pem.extend_from_slice(&key);
            let identity = Identity::from_pem(&pem)
                .map_err(|e| UpstreamError::Config(format!("invalid client identity: {e}")))?;
            builder = builder.identity(identity);
        }
        if config.insecure_skip_tls_verify {
            builder = builder.danger_accept_invalid_certs(true);
        }

        let client = builder
            .build()
            .map_err(|e| UpstreamError::Config(e.to_string()))?;
        Ok(Self { base, client })
    }

    fn url_for(&self, path_and_query: &str) -> Result<Url, UpstreamError> {
        self.base
            .join(path_and_query)
            .map_err(|e| UpstreamError::Config(format!("invalid request path: {e}")))
    }

    /// Send a request and return the streaming response.
    pub async fn send(
        &self,
        method: &str,
        path_and_query: &str,
        headers: &BTreeMap<String, Vec<String>>,
        body: Vec<u8>,
    ) -> Result<reqwest::Response, UpstreamError> {
        let method = Method::from_bytes(method.as_bytes())
            .map_err(|e| UpstreamError::Config(format!("invalid method: {e}")))?;
        let mut request = self.client.request(method, self.url_for(path_and_query)?);
        for (name, values) in headers {
            if is_stripped(name) {
                continue;
            }
            for value in values {
                request = request.header(name, value);
            }
        }
        if !body.is_empty() {
            request = request.body(body);
        }
        request
            .send()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))
    }

    /// Execute a request and buffer the whole response, the shape the
    /// dual-write workflows record in their history.
    pub async fn execute_buffered(&self, req: &KubeRequest) -> Result<KubeResponse, UpstreamError> {
        let mut headers: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for (name, value) in &req.headers {
            headers
                .entry(name.to_ascii_lowercase())
                .or_default()
                .push(value.clone());
        }

        let response = self
            .send(&req.method, &req.path_and_query, &headers, req.body.clone())
            .await?;
        let status = response.status().as_u16();
        let response_headers: Vec<(String, String)> = response
            .headers()
            .iter()
            .filter(|(name, _)| !is_stripped(name.as_str()))
            .map(|(name, value)| {
                (
                    name.as_str().to_string(),
                    String::from_utf8_lossy(value.as_bytes()).into_owned(),
                )
            })
            .collect();
        let body = response
            .bytes()
            .await
            .map_err(|e| UpstreamError::Transport(e.to_string()))?
            .to_vec();

        let err_status = if status >= 400 {
            serde_json::from_slice::<KubeStatus>(&body)
                .ok()
                .filter(|s| s.kind == "Status")
        } else {
            None
        };

        Ok(KubeResponse {
            status,
            headers: response_headers,
            body,
            err_status,
        })
    }
}

#[async_trait]
impl KubeClient for UpstreamClient {
    async fn execute(&self, req: &KubeRequest) -> Result<KubeResponse, ActivityError> {
        self.execute_buffered(req)
            .await
            .map_err(|e| ActivityError::Unavailable(e.to_string()))
    }

    async fn resource_exists(&self, path: &str) -> Result<bool, ActivityError> {
        let response = self
            .send("GET", path, &BTreeMap::new(), Vec::new())
            .await
            .map_err(|e| ActivityError::Unavailable(e.to_string()))?;
        match response.status().as_u16() {
            200..=299 => Ok(true),
            404 => Ok(false),
            other => Err(ActivityError::Unavailable(format!(
                "unexpected status {other} probing {path}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stripped_headers() {
        assert!(is_stripped("Authorization"));
        assert!(is_stripped("host"));
        assert!(is_stripped("Content-Length"));
        assert!(!is_stripped("accept"));
        assert!(!is_stripped("content-type"));
    }

    #[test]
    fn test_url_join_preserves_query() {
        let client = UpstreamClient::new(&UpstreamConfig {
            server: "https://kube.example:6443".into(),
            ca_cert: None,
            client_cert: None,
            client_key: None,
            insecure_skip_tls_verify: false,
        })
        .unwrap();
        let url = client
            .url_for("/api/v1/namespaces/ns/pods?watch=true")
            .unwrap();
        assert_eq!(url.path(), "/api/v1/namespaces/ns/pods");
        assert_eq!(url.query(), Some("watch=true"));
    }
}

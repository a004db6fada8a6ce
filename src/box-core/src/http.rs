//! HTTP transport boundary. The rest of the pipeline depends on the
//! [`HttpTransport`] trait rather than `reqwest::Client` directly so tests
//! can substitute a canned transport.

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request failed: {0}")]
    Request(String),

    #[error("upstream returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("response body was not valid utf-8/json: {0}")]
    Decode(String),
}

/// Join `path` onto `base`, validating the result is a well-formed URL
/// before it ever reaches `reqwest`.
pub fn build_url(base: &str, path: &str) -> Result<String, TransportError> {
    let base = url::Url::parse(base).map_err(|e| TransportError::Request(format!("invalid base url {base}: {e}")))?;
    base.join(path)
        .map(|u| u.to_string())
        .map_err(|e| TransportError::Request(format!("invalid path {path}: {e}")))
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn is_rate_limited(&self) -> bool {
        self.status == 429
    }

    pub fn is_auth_error(&self) -> bool {
        self.status == 401 || self.status == 403
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, TransportError>;
}

/// `reqwest`-backed transport used in production.
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(30))
            .build()
            .expect("reqwest client builder should never fail with static config");
        Self { client }
    }
}

impl Default for ReqwestTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn get(
        &self,
        url: &str,
        query: &[(&str, String)],
        headers: &[(&str, String)],
    ) -> Result<HttpResponse, TransportError> {
        let mut req = self.client.get(url).query(query);
        for (k, v) in headers {
            req = req.header(*k, v.as_str());
        }
        let resp = req.send().await.map_err(|e| TransportError::Request(e.to_string()))?;
        let status = resp.status().as_u16();
        let body = resp
            .text()
            .await
            .map_err(|e| TransportError::Decode(e.to_string()))?;
        Ok(HttpResponse { status, body })
    }
}

#[cfg(test)]
pub mod mock {
    use super::*;
    use std::sync::Mutex;

    /// A canned transport returning queued responses in order, recording the
    /// URLs it was called with for assertions.
    pub struct CannedTransport {
        responses: Mutex<Vec<Result<HttpResponse, TransportError>>>,
        pub calls: Mutex<Vec<String>>,
    }

    impl CannedTransport {
        pub fn new(mut responses: Vec<Result<HttpResponse, TransportError>>) -> Self {
            responses.reverse();
            Self {
                responses: Mutex::new(responses),
                calls: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl HttpTransport for CannedTransport {
        async fn get(
            &self,
            url: &str,
            _query: &[(&str, String)],
            _headers: &[(&str, String)],
        ) -> Result<HttpResponse, TransportError> {
            self.calls.lock().unwrap().push(url.to_string());
            self.responses
                .lock()
                .unwrap()
                .pop()
                .unwrap_or_else(|| Err(TransportError::Request("no more canned responses".into())))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn build_url_joins_path_onto_base_without_trailing_slash() {
        let url = build_url("https://api.example-broker.test", "instruments").unwrap();
        assert_eq!(url, "https://api.example-broker.test/instruments");
    }

    #[test]
    fn build_url_rejects_malformed_base() {
        assert!(build_url("not a url", "instruments").is_err());
    }
}

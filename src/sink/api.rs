//! Result upload: a single authenticated POST, no retry.

use std::time::Duration;

use reqwest::Client;
use tracing::{debug, info};

use super::SinkError;
use crate::model::TestResult;

/// Longest error body kept in [`SinkError::Status`].
const MAX_ERROR_BODY: usize = 512;

pub struct ApiClient {
    client: Client,
    endpoint: reqwest::Url,
    key: String,
}

impl ApiClient {
    pub fn new(endpoint: &str, key: &str, timeout: Duration) -> Result<Self, SinkError> {
        let endpoint =
            reqwest::Url::parse(endpoint).map_err(|_| SinkError::Endpoint(endpoint.to_string()))?;
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("xmnz-tester/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint,
            key: key.to_string(),
        })
    }

    pub fn endpoint(&self) -> &str {
        self.endpoint.as_str()
    }

    pub async fn send(&self, result: &TestResult) -> Result<(), SinkError> {
        debug!(endpoint = %self.endpoint, run_id = %result.run_id(), "uploading result");
        let resp = self
            .client
            .post(self.endpoint.clone())
            .bearer_auth(&self.key)
            .json(result)
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let mut body = resp.text().await.unwrap_or_default();
            if body.len() > MAX_ERROR_BODY {
                let mut cut = MAX_ERROR_BODY;
                while !body.is_char_boundary(cut) {
                    cut -= 1;
                }
                body.truncate(cut);
            }
            return Err(SinkError::Status {
                status: status.as_u16(),
                body,
            });
        }

        info!(endpoint = %self.endpoint, %status, "result uploaded");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_malformed_endpoint() {
        let err = ApiClient::new("not a url", "k", Duration::from_secs(1))
            .err()
            .unwrap();
        assert!(matches!(err, SinkError::Endpoint(_)));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_soft_error() {
        // Port 9 on loopback is closed on any sane test host.
        let api = ApiClient::new("http://127.0.0.1:9/results", "k", Duration::from_millis(500)).unwrap();
        let err = api.send(&TestResult::new("ST")).await.unwrap_err();
        assert!(matches!(err, SinkError::Http(_)));
    }
}

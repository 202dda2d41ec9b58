//! HTTP client for the text-analytics backend.

use super::structured::read_json;
use super::{BackendResponse, ClientError, TextAnalyticsBackend};
use async_trait::async_trait;

const SERVICE: &str = "text-analytics backend";

#[derive(Clone, Debug)]
pub struct NlpaasClient {
    client: reqwest::Client,
    base_url: String,
}

impl NlpaasClient {
    pub fn new(base_url: &str) -> Self {
        Self::with_client(reqwest::Client::new(), base_url)
    }

    pub fn with_client(client: reqwest::Client, base_url: &str) -> Self {
        Self {
            client,
            base_url: base_url.to_owned(),
        }
    }
}

/// Extracts the run path from a registration response, without a leading `/`.
fn run_path_from_registration(body: &serde_json::Value) -> Result<String, ClientError> {
    let location = body
        .get("location")
        .and_then(serde_json::Value::as_str)
        .ok_or_else(|| ClientError::InvalidResponse {
            service: SERVICE,
            reason: "registration response has no location".into(),
        })?;
    Ok(location.strip_prefix('/').unwrap_or(location).to_owned())
}

#[async_trait]
impl TextAnalyticsBackend for NlpaasClient {
    async fn register(&self, source: &str) -> Result<String, ClientError> {
        let response = self
            .client
            .post(format!("{}job/register_nlpql", self.base_url))
            .header(reqwest::header::CONTENT_TYPE, "text/plain")
            .body(source.to_owned())
            .send()
            .await
            .map_err(|e| ClientError::Connection {
                service: SERVICE,
                reason: e.to_string(),
            })?;

        let status = response.status().as_u16();
        let body = read_json(response).await;
        if !matches!(status, 200 | 201) {
            return Err(ClientError::Status {
                service: SERVICE,
                status,
                body: body.to_string(),
            });
        }
        run_path_from_registration(&body)
    }

    async fn run(
        &self,
        run_path: &str,
        context: &serde_json::Value,
    ) -> Result<BackendResponse, ClientError> {
        let response = self
            .client
            .post(format!("{}{}", self.base_url, run_path))
            .json(context)
            .send()
            .await?;
        let status = response.status().as_u16();
        Ok(BackendResponse::new(status, read_json(response).await))
    }

    async fn probe(&self) -> Result<u16, ClientError> {
        let response = self.client.get(&self.base_url).send().await?;
        Ok(response.status().as_u16())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn strips_leading_slash_from_location() {
        assert_eq!(
            run_path_from_registration(&json!({"location": "/job/abc"})).expect("location"),
            "job/abc"
        );
        assert_eq!(
            run_path_from_registration(&json!({"location": "job/abc"})).expect("location"),
            "job/abc"
        );
        assert!(run_path_from_registration(&json!({})).is_err());
    }
}

//! HTTP provider plugin client.
//!
//! Speaks a small JSON protocol: every operation is a `POST` to
//! `{endpoint}/v1/{operation}`. Status codes classify failures: 404 is
//! not-found, 408, 429, 5xx and network errors are transient, any other
//! non-success status is permanent.

use async_trait::async_trait;
use reqwest::{Client, StatusCode, header};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::ProviderError;
use crate::resource::PropertyMap;

use super::{Created, Provider, ProviderResult, ReadResult, ResourceKey};

/// Environment variable holding the plugin bearer token.
pub const TOKEN_ENV: &str = "STACKWEAVE_PROVIDER_TOKEN";

/// Default request timeout in seconds.
const DEFAULT_TIMEOUT_SECS: u64 = 120;

/// Provider plugin reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    /// HTTP client.
    client: Client,
    /// Base URL without trailing slash.
    endpoint: String,
    /// Optional bearer token.
    token: Option<String>,
}

/// Error body returned by plugins.
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct OutputsBody {
    #[serde(default)]
    outputs: PropertyMap,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Request<'a> {
    #[serde(rename = "type")]
    type_token: &'a str,
    name: &'a str,
    #[serde(flatten)]
    body: serde_json::Value,
}

impl HttpProvider {
    /// Creates a client for `endpoint`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn new(endpoint: &str, token: Option<String>) -> ProviderResult<Self> {
        Self::with_timeout(endpoint, token, DEFAULT_TIMEOUT_SECS)
    }

    /// Creates a client reading its token from `STACKWEAVE_PROVIDER_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_env(endpoint: &str) -> ProviderResult<Self> {
        Self::new(endpoint, std::env::var(TOKEN_ENV).ok())
    }

    /// Creates a client with a custom timeout.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn with_timeout(
        endpoint: &str,
        token: Option<String>,
        timeout_secs: u64,
    ) -> ProviderResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| ProviderError::permanent(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Sends one operation and decodes the response.
    async fn call<T: DeserializeOwned>(
        &self,
        operation: &str,
        key: &ResourceKey,
        body: serde_json::Value,
    ) -> ProviderResult<T> {
        let url = format!("{}/v1/{operation}", self.endpoint);
        trace!(%url, resource = %key, "Calling provider plugin");

        let mut request = self
            .client
            .post(&url)
            .header(header::CONTENT_TYPE, "application/json")
            .json(&Request {
                type_token: &key.type_token,
                name: &key.name,
                body,
            });
        if let Some(token) = &self.token {
            request = request.header(header::AUTHORIZATION, format!("Bearer {token}"));
        }

        let response = request
            .send()
            .await
            .map_err(|e| ProviderError::transient(format!("Request to {url} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = serde_json::from_str::<ErrorBody>(&text)
                .map_or(text, |body| body.message);
            debug!(%status, resource = %key, operation, "Provider plugin returned an error");
            return Err(classify(status, format!("{operation} {key}: {message}")));
        }

        response.json::<T>().await.map_err(|e| {
            ProviderError::permanent(format!("Invalid response to {operation} {key}: {e}"))
        })
    }
}

/// Maps an HTTP status to a provider error classification.
fn classify(status: StatusCode, message: String) -> ProviderError {
    match status {
        StatusCode::NOT_FOUND => ProviderError::not_found(message),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => {
            ProviderError::transient(message)
        }
        s if s.is_server_error() => ProviderError::transient(message),
        _ => ProviderError::permanent(message),
    }
}

#[async_trait]
impl Provider for HttpProvider {
    async fn create(&self, key: &ResourceKey, inputs: &PropertyMap) -> ProviderResult<Created> {
        self.call("create", key, json!({ "inputs": inputs })).await
    }

    async fn read(&self, key: &ResourceKey, id: &str) -> ProviderResult<ReadResult> {
        self.call("read", key, json!({ "id": id })).await
    }

    async fn update(
        &self,
        key: &ResourceKey,
        id: &str,
        old_inputs: &PropertyMap,
        new_inputs: &PropertyMap,
    ) -> ProviderResult<PropertyMap> {
        let body: OutputsBody = self
            .call(
                "update",
                key,
                json!({ "id": id, "oldInputs": old_inputs, "newInputs": new_inputs }),
            )
            .await?;
        Ok(body.outputs)
    }

    async fn delete(&self, key: &ResourceKey, id: &str) -> ProviderResult<()> {
        let _: serde_json::Value = self.call("delete", key, json!({ "id": id })).await?;
        Ok(())
    }

    async fn invoke(&self, key: &ResourceKey, args: &PropertyMap) -> ProviderResult<PropertyMap> {
        let body: OutputsBody = self.call("invoke", key, json!({ "args": args })).await?;
        Ok(body.outputs)
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProviderErrorKind;
    use wiremock::matchers::{body_partial_json, header as header_is, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn key() -> ResourceKey {
        ResourceKey::new("aws:ecr/Repository", "apprepo")
    }

    #[tokio::test]
    async fn test_create_sends_inputs_and_token() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/create"))
            .and(header_is("authorization", "Bearer secret"))
            .and(body_partial_json(json!({
                "type": "aws:ecr/Repository",
                "name": "apprepo",
                "inputs": { "name": "apprepo" }
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "repo-1",
                "outputs": { "repositoryUrl": "123.dkr.ecr.us-west-2.amazonaws.com/apprepo" }
            })))
            .expect(1)
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), Some(String::from("secret"))).expect("client");
        let mut inputs = PropertyMap::new();
        inputs.insert(String::from("name"), json!("apprepo"));

        let created = provider.create(&key(), &inputs).await.expect("created");
        assert_eq!(created.id, "repo-1");
        assert_eq!(
            created.outputs["repositoryUrl"],
            json!("123.dkr.ecr.us-west-2.amazonaws.com/apprepo")
        );
    }

    #[tokio::test]
    async fn test_status_classification() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1/read"))
            .respond_with(ResponseTemplate::new(404).set_body_json(json!({ "message": "no such repository" })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/delete"))
            .respond_with(ResponseTemplate::new(429))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/v1/update"))
            .respond_with(ResponseTemplate::new(400).set_body_string("bad input"))
            .mount(&server)
            .await;

        let provider = HttpProvider::new(&server.uri(), None).expect("client");

        let err = provider.read(&key(), "repo-1").await.expect_err("not found");
        assert_eq!(err.kind, ProviderErrorKind::NotFound);
        assert!(err.message.contains("no such repository"));

        let err = provider.delete(&key(), "repo-1").await.expect_err("throttled");
        assert_eq!(err.kind, ProviderErrorKind::Transient);

        let err = provider
            .update(&key(), "repo-1", &PropertyMap::new(), &PropertyMap::new())
            .await
            .expect_err("rejected");
        assert_eq!(err.kind, ProviderErrorKind::Permanent);
        assert!(err.message.contains("bad input"));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_is_transient() {
        let provider = HttpProvider::with_timeout("http://127.0.0.1:9", None, 1).expect("client");
        let err = provider
            .invoke(&key(), &PropertyMap::new())
            .await
            .expect_err("unreachable");
        assert!(err.is_retryable());
    }

    #[test]
    fn test_classify_server_errors() {
        assert!(classify(StatusCode::BAD_GATEWAY, String::new()).is_retryable());
        assert!(classify(StatusCode::REQUEST_TIMEOUT, String::new()).is_retryable());
        assert!(!classify(StatusCode::FORBIDDEN, String::new()).is_retryable());
    }
}

//! HTTP implementation of `RemoteClient`.

use std::marker::PhantomData;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::Serialize;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::models::{RecordId, RemoteRecord, SyncEntity};
use crate::util::{is_http_url, normalize_text_option};

use super::{ApiError, RemoteClient, RemoteError, RemoteResult};

const DEFAULT_TIMEOUT_SECS: u64 = 15;

/// JSON-over-HTTP client for one collection.
///
/// Routes, relative to the API base URL:
///
/// | call   | request                                         |
/// |--------|-------------------------------------------------|
/// | create | `POST /{collection}` body `{id, payload}`       |
/// | update | `PUT /{collection}/{id}` + `If-Match: "<ms>"`   |
/// | delete | `DELETE /{collection}/{id}`                     |
/// | list   | `GET /{collection}?since=<ms>`                  |
///
/// Record responses are `{id, payload, updated_at}`; list returns an array.
/// Connection failures map to [`RemoteError::Transport`], per-request
/// timeouts to [`RemoteError::Timeout`].
pub struct HttpRemoteClient<T> {
    base_url: String,
    client: reqwest::Client,
    auth_token: Option<String>,
    delta: bool,
    _payload: PhantomData<fn() -> T>,
}

impl<T> Clone for HttpRemoteClient<T> {
    fn clone(&self) -> Self {
        Self {
            base_url: self.base_url.clone(),
            client: self.client.clone(),
            auth_token: self.auth_token.clone(),
            delta: self.delta,
            _payload: PhantomData,
        }
    }
}

impl<T> std::fmt::Debug for HttpRemoteClient<T> {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemoteClient")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .field("delta", &self.delta)
            .finish_non_exhaustive()
    }
}

#[derive(Serialize)]
struct CreateBody<'a, T> {
    id: &'a str,
    payload: &'a T,
}

#[derive(Serialize)]
struct UpdateBody<'a, T> {
    payload: &'a T,
}

impl<T: SyncEntity> HttpRemoteClient<T> {
    /// Create a client for `base_url` with the default request timeout
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        Self::with_timeout(base_url, Duration::from_secs(DEFAULT_TIMEOUT_SECS))
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let base_url = normalize_base_url(base_url.into())?;
        Ok(Self {
            base_url,
            client: reqwest::Client::builder().timeout(timeout).build()?,
            auth_token: None,
            delta: false,
            _payload: PhantomData,
        })
    }

    /// Build from the shared sync configuration
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let base_url = config
            .api_base_url
            .clone()
            .ok_or_else(|| Error::Config("api_base_url is required".to_string()))?;
        let client = Self::with_timeout(base_url, config.request_timeout())?;
        Ok(client.with_delta(config.incremental_fetch))
    }

    /// Send `Authorization: Bearer <token>` with every request
    #[must_use]
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.auth_token = normalize_text_option(Some(token.into()));
        self
    }

    /// Declare that the server honors `since` with a true delta
    #[must_use]
    pub const fn with_delta(mut self, delta: bool) -> Self {
        self.delta = delta;
        self
    }

    fn collection_url(&self) -> String {
        format!("{}/{}", self.base_url, T::COLLECTION)
    }

    fn record_url(&self, id: &RecordId) -> String {
        format!(
            "{}/{}",
            self.collection_url(),
            urlencoding::encode(id.as_str())
        )
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.header(reqwest::header::ACCEPT, "application/json");
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> RemoteResult<Response> {
        let response = self.authorize(request).send().await.map_err(map_send_error)?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        Err(RemoteError::Api(ApiError::from_response(status.as_u16(), &body)))
    }

    async fn read_record(response: Response) -> RemoteResult<RemoteRecord<T>> {
        let status = response.status();
        response
            .json::<RemoteRecord<T>>()
            .await
            .map_err(|error| invalid_response(status, &error))
    }
}

#[async_trait]
impl<T: SyncEntity> RemoteClient<T> for HttpRemoteClient<T> {
    async fn create(&self, client_id: &RecordId, payload: &T) -> RemoteResult<RemoteRecord<T>> {
        let request = self.client.post(self.collection_url()).json(&CreateBody {
            id: client_id.as_str(),
            payload,
        });
        let response = self.send(request).await?;
        Self::read_record(response).await
    }

    async fn update(
        &self,
        id: &RecordId,
        payload: &T,
        base_version: Option<i64>,
    ) -> RemoteResult<RemoteRecord<T>> {
        let mut request = self
            .client
            .put(self.record_url(id))
            .json(&UpdateBody { payload });
        if let Some(version) = base_version {
            request = request.header(reqwest::header::IF_MATCH, format!("\"{version}\""));
        }
        let response = self.send(request).await?;
        Self::read_record(response).await
    }

    async fn delete(&self, id: &RecordId) -> RemoteResult<()> {
        self.send(self.client.delete(self.record_url(id))).await?;
        Ok(())
    }

    async fn list(&self, since: Option<i64>) -> RemoteResult<Vec<RemoteRecord<T>>> {
        let mut request = self.client.get(self.collection_url());
        if let Some(since) = since {
            request = request.query(&[("since", since)]);
        }
        let response = self.send(request).await?;
        let status = response.status();
        response
            .json::<Vec<RemoteRecord<T>>>()
            .await
            .map_err(|error| invalid_response(status, &error))
    }

    fn supports_delta(&self) -> bool {
        self.delta
    }
}

fn map_send_error(error: reqwest::Error) -> RemoteError {
    if let Some(status) = error.status() {
        return RemoteError::Api(ApiError::new(
            status.as_u16(),
            "http_error",
            error.to_string(),
        ));
    }
    if error.is_timeout() {
        return RemoteError::Timeout(error.to_string());
    }
    RemoteError::Transport(error.to_string())
}

/// A success status whose body could not be read; the server may have
/// applied the call
fn invalid_response(status: StatusCode, error: &reqwest::Error) -> RemoteError {
    if error.is_timeout() {
        return RemoteError::Timeout(error.to_string());
    }
    RemoteError::InvalidResponse(format!(
        "HTTP {}: could not decode response body: {error}",
        status.as_u16()
    ))
}

fn normalize_base_url(raw: String) -> Result<String> {
    let base_url = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("api base URL must not be empty".to_string()))?;
    if is_http_url(&base_url) {
        Ok(base_url.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "api base URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Farm;

    #[test]
    fn normalize_base_url_rejects_invalid_values() {
        assert!(normalize_base_url(String::new()).is_err());
        assert!(normalize_base_url("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_base_url(" https://api.example.com/v1/ ".to_string()).unwrap(),
            "https://api.example.com/v1"
        );
    }

    #[test]
    fn record_urls_are_escaped() {
        let client = HttpRemoteClient::<Farm>::new("https://api.example.com/v1").unwrap();
        assert_eq!(client.collection_url(), "https://api.example.com/v1/farms");
        assert_eq!(
            client.record_url(&RecordId::from("a b/c")),
            "https://api.example.com/v1/farms/a%20b%2Fc"
        );
    }

    #[test]
    fn debug_redacts_token() {
        let client = HttpRemoteClient::<Farm>::new("https://api.example.com")
            .unwrap()
            .with_bearer_token("secret");
        let debug = format!("{client:?}");
        assert!(!debug.contains("secret"));
        assert!(debug.contains("[REDACTED]"));
    }

    #[test]
    fn from_config_requires_base_url() {
        let config = SyncConfig::default();
        assert!(HttpRemoteClient::<Farm>::from_config(&config).is_err());

        let config = SyncConfig {
            api_base_url: Some("https://api.example.com".to_string()),
            incremental_fetch: true,
            ..SyncConfig::default()
        };
        let client = HttpRemoteClient::<Farm>::from_config(&config).unwrap();
        assert!(client.supports_delta());
    }

    #[tokio::test]
    async fn unreachable_server_is_a_transport_error() {
        let client =
            HttpRemoteClient::<Farm>::with_timeout("http://127.0.0.1:9", Duration::from_millis(500))
                .unwrap();
        let error = client.list(None).await.unwrap_err();
        assert!(error.is_connection_failure(), "unexpected error: {error:?}");
    }
}

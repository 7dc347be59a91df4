//! JSON-over-HTTP remote client.
//!
//! Resources live at `{base}/{type}` (create) and `{base}/{type}/{id}`
//! (read, update, delete). Type and id are percent-encoded as single path
//! segments, so ARM-style ids containing `/` stay one segment. Bodies are plain attribute objects; the remote
//! reports the assigned identifier in an `id` field.

use async_trait::async_trait;
use reqwest::{header, Client, RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use std::time::Duration;
use tracing::{debug, trace};

use crate::error::{ConfigError, ConvergentError, RemoteError, Result};

use super::client::{RemoteClient, RemoteResult};
use super::types::{Created, ReadOutcome};

/// Environment variable holding the bearer token.
pub const TOKEN_ENV_VAR: &str = "CONVERGENT_API_TOKEN";

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Retry-after used when a 429 carries no usable header.
const DEFAULT_RETRY_AFTER_SECS: u64 = 1;

/// Attribute the remote uses for the resource identifier.
const ID_FIELD: &str = "id";

/// REST client for the remote control plane.
#[derive(Debug, Clone)]
pub struct HttpRemoteClient {
    /// HTTP client.
    client: Client,
    /// Base URL; resource paths are appended as segments.
    base_url: Url,
    /// Bearer token, if any.
    token: Option<String>,
}

impl HttpRemoteClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is not a usable http(s) URL or the
    /// HTTP client cannot be created.
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .ok()
            .filter(|url| !url.cannot_be_a_base())
            .ok_or_else(|| {
                ConvergentError::Config(ConfigError::validation(
                    format!("Invalid remote endpoint '{base_url}'"),
                    "remote.endpoint",
                ))
            })?;

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| RemoteError::network(format!("Failed to create HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url,
            token,
        })
    }

    /// Creates a client reading its token from `CONVERGENT_API_TOKEN`.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be created.
    pub fn from_env(base_url: &str, timeout: Duration) -> Result<Self> {
        let token = std::env::var(TOKEN_ENV_VAR).ok().filter(|t| !t.is_empty());
        if token.is_none() {
            debug!("{TOKEN_ENV_VAR} not set, sending unauthenticated requests");
        }
        Self::new(base_url, token, timeout)
    }

    fn url(&self, resource_type: &str, remote_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        // Cannot fail: `new` rejects cannot-be-a-base URLs.
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(resource_type);
            if let Some(id) = remote_id {
                segments.push(id);
            }
        }
        url
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request.header(header::ACCEPT, "application/json");
        match &self.token {
            Some(token) => request.header(header::AUTHORIZATION, format!("Bearer {token}")),
            None => request,
        }
    }

    /// Sends a request and maps transport failures and error statuses.
    ///
    /// Returns `None` on 404 so each caller decides what absence means.
    async fn send(&self, request: RequestBuilder) -> RemoteResult<Option<Response>> {
        let response = self.authorize(request).send().await.map_err(map_transport)?;
        let status = response.status();
        trace!("Remote responded {status}");

        if status.is_success() {
            return Ok(Some(response));
        }

        match status {
            StatusCode::NOT_FOUND => Ok(None),
            StatusCode::TOO_MANY_REQUESTS => {
                let retry_after_secs = response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|v| v.to_str().ok())
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
                Err(RemoteError::RateLimited { retry_after_secs })
            }
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                Err(RemoteError::AuthenticationFailed {
                    message: error_message(response).await,
                })
            }
            StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => Err(RemoteError::Timeout {
                message: error_message(response).await,
            }),
            StatusCode::SERVICE_UNAVAILABLE => Err(RemoteError::Unavailable {
                message: error_message(response).await,
            }),
            _ => Err(RemoteError::rejected(status.as_u16(), error_message(response).await)),
        }
    }
}

#[async_trait]
impl RemoteClient for HttpRemoteClient {
    async fn create(&self, resource_type: &str, attributes: &Value) -> RemoteResult<Created> {
        debug!("POST {resource_type}");

        let response = self
            .send(self.client.post(self.url(resource_type, None)).json(attributes))
            .await?
            .ok_or_else(|| {
                RemoteError::rejected(404, format!("Unknown resource type: {resource_type}"))
            })?;

        let body = parse_body(response).await?;
        let remote_id = match body.get(ID_FIELD) {
            Some(Value::String(id)) => id.clone(),
            Some(Value::Number(id)) => id.to_string(),
            _ => {
                return Err(RemoteError::InvalidResponse {
                    message: format!("Create response for {resource_type} has no '{ID_FIELD}'"),
                });
            }
        };

        Ok(Created {
            remote_id,
            attributes: body,
        })
    }

    async fn read(&self, resource_type: &str, remote_id: &str) -> RemoteResult<ReadOutcome> {
        debug!("GET {resource_type}/{remote_id}");

        match self
            .send(self.client.get(self.url(resource_type, Some(remote_id))))
            .await?
        {
            Some(response) => Ok(ReadOutcome::Found(parse_body(response).await?)),
            None => Ok(ReadOutcome::NotFound),
        }
    }

    async fn update(
        &self,
        resource_type: &str,
        remote_id: &str,
        attributes: &Value,
    ) -> RemoteResult<Value> {
        debug!("PUT {resource_type}/{remote_id}");

        let response = self
            .send(
                self.client
                    .put(self.url(resource_type, Some(remote_id)))
                    .json(attributes),
            )
            .await?
            .ok_or_else(|| RemoteError::not_found(resource_type, remote_id))?;

        parse_body(response).await
    }

    async fn delete(&self, resource_type: &str, remote_id: &str) -> RemoteResult<()> {
        debug!("DELETE {resource_type}/{remote_id}");

        self.send(self.client.delete(self.url(resource_type, Some(remote_id))))
            .await?
            .map(|_| ())
            .ok_or_else(|| RemoteError::not_found(resource_type, remote_id))
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

fn map_transport(e: reqwest::Error) -> RemoteError {
    if e.is_timeout() {
        RemoteError::Timeout {
            message: e.to_string(),
        }
    } else {
        RemoteError::network(format!("Request failed: {e}"))
    }
}

async fn parse_body(response: Response) -> RemoteResult<Value> {
    response
        .json::<Value>()
        .await
        .map_err(|e| RemoteError::InvalidResponse {
            message: format!("Failed to parse response: {e}"),
        })
}

/// Pulls a readable message out of an error body.
async fn error_message(response: Response) -> String {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();

    let from_json = serde_json::from_str::<Value>(&body).ok().and_then(|v| {
        v.get("message")
            .or_else(|| v.get("error").and_then(|e| e.get("message")))
            .or_else(|| v.get("error"))
            .and_then(Value::as_str)
            .map(str::to_string)
    });

    match from_json {
        Some(message) => message,
        None if body.trim().is_empty() => status.to_string(),
        None => body,
    }
}

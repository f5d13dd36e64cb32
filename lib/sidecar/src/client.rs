//! HTTP client for the sidecar API.

use crate::config::SidecarConfig;
use crate::error::SidecarError;
use async_trait::async_trait;
use flowdesk_workflow::{EventPublisher, GatewayError, ServiceInvoker, StateStore};
use reqwest::{Method, StatusCode, Url};
use rootcause::prelude::{Report, ResultExt};
use serde_json::Value as JsonValue;
use std::time::Duration;
use tracing::{debug, instrument};

/// Header carrying the sidecar API token.
const API_TOKEN_HEADER: &str = "dapr-api-token";

/// API version prefix of every sidecar route.
const API_VERSION: &str = "v1.0";

/// Client for the sidecar's state, pub/sub and invocation endpoints.
#[derive(Clone)]
pub struct SidecarClient {
    http: reqwest::Client,
    base_url: Url,
    config: SidecarConfig,
}

impl SidecarClient {
    /// Creates a client for the sidecar described by `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if the base URL is invalid or the HTTP client cannot
    /// be built.
    pub fn new(config: SidecarConfig) -> Result<Self, Report<SidecarError>> {
        let base_url = Url::parse(&config.base_url()).map_err(|e| SidecarError::InvalidUrl {
            details: e.to_string(),
        })?;
        if base_url.cannot_be_a_base() {
            return Err(SidecarError::InvalidUrl {
                details: format!("'{}' cannot be a base url", base_url),
            }
            .into());
        }

        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_seconds))
            .build()
            .map_err(|e| SidecarError::Client {
                details: e.to_string(),
            })?;

        Ok(Self {
            http,
            base_url,
            config,
        })
    }

    /// Returns the configuration in use.
    #[must_use]
    pub fn config(&self) -> &SidecarConfig {
        &self.config
    }

    /// Builds `<base>/v1.0/<segments...>`, percent-encoding each segment.
    fn url<'a>(&self, segments: impl IntoIterator<Item = &'a str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut path) = url.path_segments_mut() {
            path.pop_if_empty().push(API_VERSION).extend(segments);
        }
        url
    }

    async fn send(
        &self,
        method: Method,
        url: Url,
        body: Option<&JsonValue>,
    ) -> Result<reqwest::Response, Report<SidecarError>> {
        let url_string = url.to_string();
        let mut request = self.http.request(method, url);
        if let Some(token) = &self.config.api_token {
            request = request.header(API_TOKEN_HEADER, token);
        }
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| SidecarError::Request {
            url: url_string.clone(),
            details: e.to_string(),
        })?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(SidecarError::UnexpectedStatus {
            url: url_string,
            status: status.as_u16(),
            body,
        }
        .into())
    }

    async fn read_json(
        response: reqwest::Response,
    ) -> Result<Option<JsonValue>, Report<SidecarError>> {
        if response.status() == StatusCode::NO_CONTENT {
            return Ok(None);
        }
        let bytes = response.bytes().await.map_err(|e| SidecarError::Decode {
            details: e.to_string(),
        })?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(None);
        }
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| SidecarError::Decode {
                details: e.to_string(),
            }
            .into())
    }

    /// Saves `value` under `key` in the state store.
    #[instrument(skip(self, value))]
    pub async fn save_state(
        &self,
        key: &str,
        value: &JsonValue,
    ) -> Result<(), Report<SidecarError>> {
        let url = self.url(["state", self.config.state_store.as_str()]);
        let items = serde_json::json!([{ "key": key, "value": value }]);
        self.send(Method::POST, url, Some(&items)).await?;
        debug!("state saved");
        Ok(())
    }

    /// Reads `key` from the state store; `None` when the key is absent.
    #[instrument(skip(self))]
    pub async fn get_state(&self, key: &str) -> Result<Option<JsonValue>, Report<SidecarError>> {
        let url = self.url(["state", self.config.state_store.as_str(), key]);
        let response = self.send(Method::GET, url, None).await?;
        let value = Self::read_json(response).await?;
        debug!(found = value.is_some(), "state read");
        Ok(value)
    }

    /// Removes `key` from the state store.
    #[instrument(skip(self))]
    pub async fn delete_state(&self, key: &str) -> Result<(), Report<SidecarError>> {
        let url = self.url(["state", self.config.state_store.as_str(), key]);
        self.send(Method::DELETE, url, None).await?;
        debug!("state deleted");
        Ok(())
    }

    /// Publishes `payload` as JSON on `topic`.
    #[instrument(skip(self, payload))]
    pub async fn publish_event(
        &self,
        topic: &str,
        payload: &JsonValue,
    ) -> Result<(), Report<SidecarError>> {
        let url = self.url(["publish", self.config.pubsub.as_str(), topic]);
        self.send(Method::POST, url, Some(payload)).await?;
        debug!("event published");
        Ok(())
    }

    /// POSTs `payload` to `method` on the service registered as `app_id`.
    ///
    /// `method` may contain `/`-separated segments. An empty reply is `null`.
    #[instrument(skip(self, payload))]
    pub async fn invoke_method(
        &self,
        app_id: &str,
        method: &str,
        payload: &JsonValue,
    ) -> Result<JsonValue, Report<SidecarError>> {
        let segments = ["invoke", app_id, "method"]
            .into_iter()
            .chain(method.split('/').filter(|s| !s.is_empty()));
        let url = self.url(segments);
        let response = self.send(Method::POST, url, Some(payload)).await?;
        Ok(Self::read_json(response).await?.unwrap_or(JsonValue::Null))
    }

    /// Returns true if the sidecar reports itself healthy.
    pub async fn is_healthy(&self) -> bool {
        let url = self.url(["healthz"]);
        self.send(Method::GET, url, None).await.is_ok()
    }
}

#[async_trait]
impl StateStore for SidecarClient {
    async fn get(&self, key: &str) -> Result<Option<JsonValue>, Report<GatewayError>> {
        self.get_state(key).await.context(GatewayError::StateStore {
            operation: "get",
            key: key.to_string(),
        })
    }

    async fn save(&self, key: &str, value: JsonValue) -> Result<(), Report<GatewayError>> {
        self.save_state(key, &value)
            .await
            .context(GatewayError::StateStore {
                operation: "save",
                key: key.to_string(),
            })
    }

    async fn delete(&self, key: &str) -> Result<(), Report<GatewayError>> {
        self.delete_state(key)
            .await
            .context(GatewayError::StateStore {
                operation: "delete",
                key: key.to_string(),
            })
    }
}

#[async_trait]
impl EventPublisher for SidecarClient {
    async fn publish(&self, topic: &str, payload: JsonValue) -> Result<(), Report<GatewayError>> {
        self.publish_event(topic, &payload)
            .await
            .context(GatewayError::Publish {
                topic: topic.to_string(),
            })
    }
}

#[async_trait]
impl ServiceInvoker for SidecarClient {
    async fn invoke(
        &self,
        app_id: &str,
        method: &str,
        payload: JsonValue,
    ) -> Result<JsonValue, Report<GatewayError>> {
        self.invoke_method(app_id, method, &payload)
            .await
            .context(GatewayError::Invoke {
                app_id: app_id.to_string(),
                method: method.to_string(),
            })
    }
}

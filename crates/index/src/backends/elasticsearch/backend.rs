//! Elasticsearch backend implementation.

use std::fmt::Debug;
use std::time::Duration;

use async_trait::async_trait;
use elasticsearch::auth::Credentials;
use elasticsearch::cert::CertificateValidation;
use elasticsearch::cluster::ClusterHealthParts;
use elasticsearch::http::request::JsonBody;
use elasticsearch::http::response::Response;
use elasticsearch::http::transport::{SingleNodeConnectionPool, TransportBuilder};
use elasticsearch::indices::{
    IndicesCreateParts, IndicesDeleteParts, IndicesExistsParts, IndicesGetMappingParts,
    IndicesGetSettingsParts, IndicesPutMappingParts, IndicesPutSettingsParts, IndicesRefreshParts,
};
use elasticsearch::params::{Conflicts, Level, WaitForStatus};
use elasticsearch::{BulkParts, DeleteByQueryParts, Elasticsearch, UpdateByQueryParts};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::backend::{
    BulkAction, BulkResponse, ByQueryRequest, ByQueryResponse, ClusterHealth, IndexBackend,
};
use crate::config::humantime_serde;
use crate::error::BackendError;

use super::response as parse;

const BACKEND_NAME: &str = "elasticsearch";

/// Authentication configuration for Elasticsearch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ElasticsearchAuth {
    /// Basic username/password authentication.
    Basic {
        /// The username for basic auth.
        username: String,
        /// The password for basic auth.
        password: String,
    },
    /// Bearer token authentication.
    Bearer {
        /// The bearer token.
        token: String,
    },
}

/// Connection configuration for the Elasticsearch backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElasticsearchConfig {
    /// Elasticsearch node URLs (e.g., `["http://localhost:9200"]`).
    /// Currently uses the first node (single-node connection pool).
    pub nodes: Vec<String>,

    /// Transport timeout of a single request (default: 60s).
    #[serde(with = "humantime_serde", default = "default_request_timeout")]
    pub request_timeout: Duration,

    /// Optional authentication.
    #[serde(default)]
    pub auth: Option<ElasticsearchAuth>,

    /// Whether to disable certificate validation (default: false).
    /// Only use for development/testing.
    #[serde(default)]
    pub disable_certificate_validation: bool,
}

fn default_request_timeout() -> Duration {
    Duration::from_secs(60)
}

impl Default for ElasticsearchConfig {
    fn default() -> Self {
        Self {
            nodes: vec!["http://localhost:9200".to_string()],
            request_timeout: default_request_timeout(),
            auth: None,
            disable_certificate_validation: false,
        }
    }
}

/// [`IndexBackend`] over an Elasticsearch cluster.
pub struct ElasticsearchBackend {
    client: Elasticsearch,
    config: ElasticsearchConfig,
}

impl Debug for ElasticsearchBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticsearchBackend")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl ElasticsearchBackend {
    /// Creates a new Elasticsearch backend with the given configuration.
    pub fn new(config: ElasticsearchConfig) -> Result<Self, BackendError> {
        let client = Self::build_client(&config)?;
        Ok(Self { client, config })
    }

    /// Builds the Elasticsearch client from configuration.
    fn build_client(config: &ElasticsearchConfig) -> Result<Elasticsearch, BackendError> {
        let url = config
            .nodes
            .first()
            .cloned()
            .unwrap_or_else(|| "http://localhost:9200".to_string());

        let parsed_url: elasticsearch::http::Url =
            url.parse().map_err(|e| BackendError::ConnectionFailed {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("Invalid URL: {}", e),
            })?;

        let conn_pool = SingleNodeConnectionPool::new(parsed_url);

        let mut builder = TransportBuilder::new(conn_pool).timeout(config.request_timeout);

        if config.disable_certificate_validation {
            builder = builder.cert_validation(CertificateValidation::None);
        }

        if let Some(ref auth) = config.auth {
            builder = match auth {
                ElasticsearchAuth::Basic { username, password } => {
                    builder.auth(Credentials::Basic(username.clone(), password.clone()))
                }
                ElasticsearchAuth::Bearer { token } => {
                    builder.auth(Credentials::Bearer(token.clone()))
                }
            };
        }

        let transport = builder.build().map_err(|e| BackendError::ConnectionFailed {
            backend_name: BACKEND_NAME.to_string(),
            message: format!("Failed to build transport: {}", e),
        })?;

        Ok(Elasticsearch::new(transport))
    }

    /// Returns the backend configuration.
    pub fn config(&self) -> &ElasticsearchConfig {
        &self.config
    }
}

fn unavailable(context: &str, err: elasticsearch::Error) -> BackendError {
    BackendError::Unavailable {
        backend_name: BACKEND_NAME.to_string(),
        message: format!("{}: {}", context, err),
    }
}

/// Reads a JSON body, turning non-success statuses into errors.
async fn json_body(response: Response, context: &str) -> Result<Value, BackendError> {
    let status = response.status_code();
    if !status.is_success() {
        let body = response.text().await.unwrap_or_default();
        return Err(BackendError::Internal {
            backend_name: BACKEND_NAME.to_string(),
            message: format!("{} (status {}): {}", context, status, body),
            source: None,
        });
    }
    response
        .json::<Value>()
        .await
        .map_err(|e| BackendError::SerializationError {
            message: format!("{}: {}", context, e),
        })
}

fn names(indices: &[String]) -> Vec<&str> {
    indices.iter().map(String::as_str).collect()
}

#[async_trait]
impl IndexBackend for ElasticsearchBackend {
    fn name(&self) -> &'static str {
        BACKEND_NAME
    }

    async fn indices_exist(&self, indices: &[String]) -> Result<bool, BackendError> {
        let names = names(indices);
        let response = self
            .client
            .indices()
            .exists(IndicesExistsParts::Index(&names))
            .send()
            .await
            .map_err(|e| unavailable("Failed to check index existence", e))?;
        Ok(response.status_code().is_success())
    }

    async fn create_index(
        &self,
        index: &str,
        settings: &Value,
        mapping: &Value,
    ) -> Result<bool, BackendError> {
        let response = self
            .client
            .indices()
            .create(IndicesCreateParts::Index(index))
            .body(json!({ "settings": settings, "mappings": mapping }))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to create index {}", index), e))?;

        let status = response.status_code();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 400 with "resource_already_exists_exception" is OK (race condition)
            if body.contains("resource_already_exists_exception") {
                return Ok(true);
            }
            return Err(BackendError::Internal {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("Failed to create index {} (status {}): {}", index, status, body),
                source: None,
            });
        }

        let body = json_body(response, "Failed to read create index response").await?;
        debug!(index = %index, "Created Elasticsearch index");
        Ok(parse::acknowledged(&body))
    }

    async fn delete_indices(&self, indices: &[String]) -> Result<bool, BackendError> {
        let names = names(indices);
        let joined = indices.join(",");
        let response = self
            .client
            .indices()
            .delete(IndicesDeleteParts::Index(&names))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to delete indices {}", joined), e))?;

        let status = response.status_code();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            // 404 is OK (index doesn't exist)
            if body.contains("index_not_found_exception") {
                return Ok(true);
            }
            return Err(BackendError::Internal {
                backend_name: BACKEND_NAME.to_string(),
                message: format!("Failed to delete indices {}: {}", joined, body),
                source: None,
            });
        }

        let body = json_body(response, "Failed to read delete index response").await?;
        debug!(indices = %joined, "Deleted Elasticsearch indices");
        Ok(parse::acknowledged(&body))
    }

    async fn get_mapping(&self, index: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .indices()
            .get_mapping(IndicesGetMappingParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to get mapping of {}", index), e))?;
        let body = json_body(response, "Failed to get mapping").await?;
        Ok(parse::mapping(&body, index))
    }

    async fn put_mapping(&self, index: &str, mapping: &Value) -> Result<bool, BackendError> {
        let response = self
            .client
            .indices()
            .put_mapping(IndicesPutMappingParts::Index(&[index]))
            .body(mapping.clone())
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to update mapping of {}", index), e))?;
        let body = json_body(response, "Failed to update mapping").await?;
        Ok(parse::acknowledged(&body))
    }

    async fn get_settings(&self, index: &str) -> Result<Value, BackendError> {
        let response = self
            .client
            .indices()
            .get_settings(IndicesGetSettingsParts::Index(&[index]))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to get settings of {}", index), e))?;
        let body = json_body(response, "Failed to get settings").await?;
        Ok(parse::settings(&body, index))
    }

    async fn put_settings(&self, index: &str, settings: &Value) -> Result<bool, BackendError> {
        let response = self
            .client
            .indices()
            .put_settings(IndicesPutSettingsParts::Index(&[index]))
            .body(json!({ "index": settings }))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to update settings of {}", index), e))?;
        let body = json_body(response, "Failed to update settings").await?;
        Ok(parse::acknowledged(&body))
    }

    async fn refresh(&self, indices: &[String]) -> Result<(), BackendError> {
        let names = names(indices);
        let response = self
            .client
            .indices()
            .refresh(IndicesRefreshParts::Index(&names))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to refresh indices {:?}", indices), e))?;
        json_body(response, "Failed to refresh indices").await?;
        Ok(())
    }

    async fn cluster_health(
        &self,
        indices: &[String],
        timeout: Duration,
    ) -> Result<ClusterHealth, BackendError> {
        let names = names(indices);
        let parts = if names.is_empty() {
            ClusterHealthParts::None
        } else {
            ClusterHealthParts::Index(&names)
        };
        let timeout = format!("{}ms", timeout.as_millis());
        let response = self
            .client
            .cluster()
            .health(parts)
            .wait_for_status(WaitForStatus::Yellow)
            .timeout(&timeout)
            .level(Level::Indices)
            .send()
            .await
            .map_err(|e| unavailable("Health check failed", e))?;

        // a poll that times out answers 408 with a regular health body
        let body = response
            .json::<Value>()
            .await
            .map_err(|e| BackendError::SerializationError {
                message: format!("Failed to parse health response: {}", e),
            })?;
        parse::health(&body)
    }

    async fn update_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        let mut body = json!({ "query": request.query });
        if let Some(script) = &request.script {
            body["script"] = script.to_json();
        }
        let response = self
            .client
            .update_by_query(UpdateByQueryParts::Index(&[request.index.as_str()]))
            .conflicts(Conflicts::Proceed)
            .scroll_size(request.batch_size as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to update by query in {}", request.index), e))?;
        let body = json_body(response, "Failed to update by query").await?;
        Ok(parse::by_query(&body))
    }

    async fn delete_by_query(
        &self,
        request: &ByQueryRequest,
    ) -> Result<ByQueryResponse, BackendError> {
        let response = self
            .client
            .delete_by_query(DeleteByQueryParts::Index(&[request.index.as_str()]))
            .conflicts(Conflicts::Proceed)
            .scroll_size(request.batch_size as i64)
            .body(json!({ "query": request.query }))
            .send()
            .await
            .map_err(|e| unavailable(&format!("Failed to delete by query in {}", request.index), e))?;
        let body = json_body(response, "Failed to delete by query").await?;
        Ok(parse::by_query(&body))
    }

    async fn bulk(&self, actions: Vec<BulkAction>) -> Result<BulkResponse, BackendError> {
        let mut body: Vec<JsonBody<Value>> = Vec::with_capacity(actions.len() * 2);
        for action in actions {
            body.push(JsonBody::new(action.header()));
            if let BulkAction::Index { source, .. } = action {
                body.push(JsonBody::new(source));
            }
        }
        let response = self
            .client
            .bulk(BulkParts::None)
            .body(body)
            .send()
            .await
            .map_err(|e| unavailable("Failed to send bulk request", e))?;
        let body = json_body(response, "Failed to send bulk request").await?;
        Ok(parse::bulk(&body))
    }
}

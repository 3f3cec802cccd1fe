//! Schema registry client interface and HTTP implementation.
//!
//! The cache talks to the registry through the [`SchemaRegistry`] trait so
//! tests can substitute an in-memory registry. [`HttpSchemaRegistry`] is
//! the production implementation against a Confluent-style REST API.

use crate::error::{Result, SchemaError};
use crate::types::{RegisteredSchema, SchemaFormat};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

/// Narrow interface to a versioned schema registry.
///
/// Registration is idempotent on the registry side: registering a schema
/// text that already exists under a subject returns the existing id. The
/// cache relies on this to let concurrent first-use registrations converge
/// without a global lock.
#[async_trait]
pub trait SchemaRegistry: Send + Sync {
    /// Register a schema under a subject and return its id.
    ///
    /// Returns the existing id if the identical schema is already
    /// registered under the subject.
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        format: SchemaFormat,
    ) -> Result<i32>;

    /// Fetch the latest registered schema for a subject.
    async fn get_latest_schema(&self, subject: &str) -> Result<RegisteredSchema>;

    /// Check whether a schema can safely replace the currently registered
    /// version for a subject.
    async fn check_compatible(&self, subject: &str, schema: &str) -> Result<bool>;

    /// List all subjects known to the registry.
    async fn list_subjects(&self) -> Result<Vec<String>>;
}

#[derive(Debug, Serialize)]
struct RegisterSchemaRequest {
    schema: String,

    #[serde(rename = "schemaType")]
    schema_type: String,
}

#[derive(Debug, Deserialize)]
struct RegisterSchemaResponse {
    id: i32,
}

#[derive(Debug, Deserialize)]
struct SchemaResponse {
    id: i32,
    subject: String,
    version: i32,
    schema: String,
}

/// HTTP client for a Confluent-style schema registry REST API.
///
/// # Examples
///
/// ```ignore
/// let registry = HttpSchemaRegistry::new("http://localhost:8081".to_string());
/// let id = registry.register_schema("orders-value", schema_json, SchemaFormat::Avro).await?;
/// ```
pub struct HttpSchemaRegistry {
    base_url: String,
    http_client: reqwest::Client,
}

impl HttpSchemaRegistry {
    /// Create a new registry client.
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the registry (e.g., "http://localhost:8081")
    pub fn new(base_url: String) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| SchemaError::Transport(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            base_url,
            http_client,
        })
    }

    /// Map a reqwest error into the schema error taxonomy.
    fn map_transport_error(err: reqwest::Error) -> SchemaError {
        if err.is_timeout() {
            SchemaError::Timeout
        } else {
            SchemaError::Transport(err.to_string())
        }
    }

    /// Map a non-success response into the schema error taxonomy.
    async fn map_status_error(subject: &str, response: reqwest::Response) -> SchemaError {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        match status {
            401 | 403 => SchemaError::Unauthorized(body),
            404 => SchemaError::SubjectNotFound(subject.to_string()),
            422 => SchemaError::InvalidSchema(body),
            _ => SchemaError::RegistryStatus { status, body },
        }
    }
}

#[async_trait]
impl SchemaRegistry for HttpSchemaRegistry {
    async fn register_schema(
        &self,
        subject: &str,
        schema: &str,
        format: SchemaFormat,
    ) -> Result<i32> {
        let url = format!("{}/subjects/{}/versions", self.base_url, subject);

        let request = RegisterSchemaRequest {
            schema: schema.to_string(),
            schema_type: format.as_str().to_string(),
        };

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(subject, response).await);
        }

        let register_response: RegisterSchemaResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::Transport(format!("malformed registration response: {}", e)))?;

        debug!(
            schema_id = register_response.id,
            subject = subject,
            format = ?format,
            "Schema registered"
        );

        Ok(register_response.id)
    }

    async fn get_latest_schema(&self, subject: &str) -> Result<RegisteredSchema> {
        let url = format!("{}/subjects/{}/versions/latest", self.base_url, subject);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(subject, response).await);
        }

        let schema: SchemaResponse = response
            .json()
            .await
            .map_err(|e| SchemaError::Transport(format!("malformed schema response: {}", e)))?;

        debug!(
            schema_id = schema.id,
            subject = %schema.subject,
            version = schema.version,
            "Schema retrieved"
        );

        Ok(RegisteredSchema {
            id: schema.id,
            subject: schema.subject,
            version: schema.version,
            schema: schema.schema,
        })
    }

    async fn check_compatible(&self, subject: &str, schema: &str) -> Result<bool> {
        let url = format!(
            "{}/compatibility/subjects/{}/versions/latest",
            self.base_url, subject
        );

        let request = serde_json::json!({ "schema": schema });

        let response = self
            .http_client
            .post(&url)
            .json(&request)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error(subject, response).await);
        }

        let result: serde_json::Value = response
            .json()
            .await
            .map_err(|e| SchemaError::Transport(format!("malformed compatibility response: {}", e)))?;

        let is_compatible = result
            .get("is_compatible")
            .and_then(|v| v.as_bool())
            .unwrap_or(false);

        debug!(
            subject = subject,
            is_compatible = is_compatible,
            "Compatibility check completed"
        );

        Ok(is_compatible)
    }

    async fn list_subjects(&self) -> Result<Vec<String>> {
        let url = format!("{}/subjects", self.base_url);

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(Self::map_transport_error)?;

        if !response.status().is_success() {
            return Err(Self::map_status_error("", response).await);
        }

        response
            .json()
            .await
            .map_err(|e| SchemaError::Transport(format!("malformed subjects response: {}", e)))
    }
}

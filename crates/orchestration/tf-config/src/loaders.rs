//! Concrete configuration loaders.
//!
//! Each variant reads bytes from its source, then hands them to the rule
//! parser. Errors name the failing stage: a read failure surfaces as a
//! source error, a parse or validation failure as a configuration error.

use crate::ConfigLoader;
use async_trait::async_trait;
use tf_error::{ConfigError, FilterError, Result, SourceError};
use tf_processor::BlobStore;
use tf_rules::RuleConfig;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use std::sync::Arc;

/// Configurations are small; anything past this is a broken source.
const MAX_CONFIG_BYTES: u64 = 1024 * 1024;

/// Loads configuration from a blob store object.
pub struct BlobConfigLoader {
    store: Arc<dyn BlobStore>,
    bucket: String,
    key: String,
}

impl BlobConfigLoader {
    pub fn new(store: Arc<dyn BlobStore>, bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            store,
            bucket: bucket.into(),
            key: key.into(),
        }
    }
}

#[async_trait]
impl ConfigLoader for BlobConfigLoader {
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig> {
        debug!(bucket = %self.bucket, key = %self.key, "loading configuration from blob store");

        let body = tokio::select! {
            _ = cancel.cancelled() => return Err(FilterError::Cancelled),
            body = self.store.get_stream(&self.bucket, &self.key) => body?,
        };

        let mut raw = String::new();
        let mut reader = body.reader.take(MAX_CONFIG_BYTES);
        reader
            .read_to_string(&mut raw)
            .await
            .map_err(|e| FilterError::Source(SourceError::Read(format!("config read: {e}"))))?;

        Ok(RuleConfig::load(&raw)?)
    }

    fn describe(&self) -> String {
        format!("blob(bucket={}, key={})", self.bucket, self.key)
    }
}

/// Loads configuration from a named parameter, decrypted.
pub struct ParameterConfigLoader {
    client: aws_sdk_ssm::Client,
    parameter_name: String,
}

impl ParameterConfigLoader {
    pub fn new(client: aws_sdk_ssm::Client, parameter_name: impl Into<String>) -> Self {
        Self {
            client,
            parameter_name: parameter_name.into(),
        }
    }
}

#[async_trait]
impl ConfigLoader for ParameterConfigLoader {
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig> {
        debug!(parameter = %self.parameter_name, "loading configuration from parameter store");

        let request = self
            .client
            .get_parameter()
            .name(self.parameter_name.as_str())
            .with_decryption(true)
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FilterError::Cancelled),
            response = request => response.map_err(|e| {
                FilterError::Source(SourceError::Read(format!(
                    "failed to get parameter {}: {e}",
                    self.parameter_name
                )))
            })?,
        };

        let value = response
            .parameter()
            .and_then(|p| p.value())
            .ok_or_else(|| {
                FilterError::Source(SourceError::Read(format!(
                    "parameter {} has no value",
                    self.parameter_name
                )))
            })?;

        Ok(RuleConfig::load(value)?)
    }

    fn describe(&self) -> String {
        format!("parameter(name={})", self.parameter_name)
    }
}

/// Loads configuration from a secrets store entry.
pub struct SecretConfigLoader {
    client: aws_sdk_secretsmanager::Client,
    secret_id: String,
}

impl SecretConfigLoader {
    pub fn new(client: aws_sdk_secretsmanager::Client, secret_id: impl Into<String>) -> Self {
        Self {
            client,
            secret_id: secret_id.into(),
        }
    }
}

#[async_trait]
impl ConfigLoader for SecretConfigLoader {
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig> {
        debug!(secret_id = %self.secret_id, "loading configuration from secrets store");

        let request = self
            .client
            .get_secret_value()
            .secret_id(self.secret_id.as_str())
            .send();

        let response = tokio::select! {
            _ = cancel.cancelled() => return Err(FilterError::Cancelled),
            response = request => response.map_err(|e| {
                FilterError::Source(SourceError::Read(format!(
                    "failed to get secret {}: {e}",
                    self.secret_id
                )))
            })?,
        };

        let value = response.secret_string().ok_or_else(|| {
            FilterError::Source(SourceError::Read(format!(
                "secret {} has no string value",
                self.secret_id
            )))
        })?;

        Ok(RuleConfig::load(value)?)
    }

    fn describe(&self) -> String {
        format!("secret(id={})", self.secret_id)
    }
}

/// Loads configuration from a local file.
pub struct LocalConfigLoader {
    path: String,
}

impl LocalConfigLoader {
    pub fn new(path: impl Into<String>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl ConfigLoader for LocalConfigLoader {
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig> {
        debug!(path = %self.path, "loading configuration from local file");

        // Reject traversal outside the configured directory
        if self.path.contains("..") {
            return Err(FilterError::Config(ConfigError::Parse(
                "invalid config file path".to_string(),
            )));
        }

        let raw = tokio::select! {
            _ = cancel.cancelled() => return Err(FilterError::Cancelled),
            raw = tokio::fs::read_to_string(&self.path) => raw.map_err(|e| {
                FilterError::Source(SourceError::Read(format!(
                    "failed to read config file: {e}"
                )))
            })?,
        };

        Ok(RuleConfig::load(&raw)?)
    }

    fn describe(&self) -> String {
        format!("local(path={})", self.path)
    }
}

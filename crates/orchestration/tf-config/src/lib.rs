//! Rule configuration loading.
//!
//! A [`ConfigLoader`] turns some byte source into a validated
//! [`RuleConfig`]. Concrete loaders exist for blob storage, an encrypted
//! parameter store, a secrets store, and the local filesystem; all of them
//! compose with [`CachedConfigLoader`], which adds TTL caching, a
//! pre-compiled snapshot, and single-flight refresh.

mod cached;
mod loaders;

pub use cached::CachedConfigLoader;
pub use loaders::{
    BlobConfigLoader, LocalConfigLoader, ParameterConfigLoader, SecretConfigLoader,
};

use async_trait::async_trait;
use tf_error::Result;
use tf_rules::RuleConfig;
use tokio_util::sync::CancellationToken;

/// Capability for loading a rule configuration from somewhere.
#[async_trait]
pub trait ConfigLoader: Send + Sync {
    /// Fetch, parse and validate a configuration.
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig>;

    /// A label describing the source, for logging.
    fn describe(&self) -> String;
}

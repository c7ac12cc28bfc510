//! TTL-cached configuration loader.

use crate::ConfigLoader;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tf_error::{FilterError, Result};
use tf_rules::{CompiledRuleSet, RuleConfig};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::debug;

struct Snapshot {
    config: RuleConfig,
    compiled: Arc<CompiledRuleSet>,
    loaded_at: Instant,
}

/// Wraps any loader with a TTL cache and a pre-compiled snapshot.
///
/// While the snapshot is fresh, loads return it under a read lock. A stale
/// snapshot is refreshed under the write lock with a double check, so
/// concurrent callers arriving at staleness trigger exactly one underlying
/// load. Readers never observe a partial state: the configuration and its
/// compiled form are published together. A refresh that fails or is
/// cancelled leaves the prior snapshot in place.
pub struct CachedConfigLoader {
    loader: Arc<dyn ConfigLoader>,
    ttl: Duration,
    state: RwLock<Option<Snapshot>>,
}

impl CachedConfigLoader {
    /// Wrap a loader with the given time-to-live.
    pub fn new(loader: Arc<dyn ConfigLoader>, ttl: Duration) -> Self {
        Self {
            loader,
            ttl,
            state: RwLock::new(None),
        }
    }

    /// Return the compiled rule set, refreshing the snapshot if stale.
    ///
    /// This is the call sites' fast path: the snapshot is shared behind an
    /// `Arc`, so evaluation never clones rules.
    pub async fn load_compiled(&self, cancel: &CancellationToken) -> Result<Arc<CompiledRuleSet>> {
        {
            let state = self.state.read().await;
            if let Some(snapshot) = state.as_ref() {
                if snapshot.loaded_at.elapsed() < self.ttl {
                    return Ok(Arc::clone(&snapshot.compiled));
                }
            }
        }

        let snapshot = self.refresh(cancel).await?;
        Ok(snapshot)
    }

    async fn refresh(&self, cancel: &CancellationToken) -> Result<Arc<CompiledRuleSet>> {
        let mut state = self.state.write().await;

        // Double-check: another caller may have refreshed while we waited
        // for the write lock.
        if let Some(snapshot) = state.as_ref() {
            if snapshot.loaded_at.elapsed() < self.ttl {
                return Ok(Arc::clone(&snapshot.compiled));
            }
        }

        debug!(loader = %self.loader.describe(), "loading fresh configuration");

        let config = self.loader.load(cancel).await?;
        let compiled = Arc::new(CompiledRuleSet::prepare(&config).map_err(FilterError::Config)?);

        *state = Some(Snapshot {
            config,
            compiled: Arc::clone(&compiled),
            loaded_at: Instant::now(),
        });

        Ok(compiled)
    }
}

#[async_trait]
impl ConfigLoader for CachedConfigLoader {
    async fn load(&self, cancel: &CancellationToken) -> Result<RuleConfig> {
        {
            let state = self.state.read().await;
            if let Some(snapshot) = state.as_ref() {
                if snapshot.loaded_at.elapsed() < self.ttl {
                    debug!(
                        loader = %self.loader.describe(),
                        age_ms = snapshot.loaded_at.elapsed().as_millis() as u64,
                        "returning cached configuration"
                    );
                    return Ok(snapshot.config.clone());
                }
            }
        }

        self.refresh(cancel).await?;

        let state = self.state.read().await;
        let snapshot = state
            .as_ref()
            .expect("snapshot present after successful refresh");
        Ok(snapshot.config.clone())
    }

    fn describe(&self) -> String {
        format!("cached({}, ttl={:?})", self.loader.describe(), self.ttl)
    }
}

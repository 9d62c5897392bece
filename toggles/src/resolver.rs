use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use metrics::counter;
use serde::Serialize;
use tracing::instrument;

use crate::cache::{FlagCache, FlagSnapshot};
use crate::defaults::StaticDefaultsTable;
use crate::env_overrides::EnvironmentOverrideResolver;
use crate::store::FlagStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum FlagSource {
    Env,
    Override,
    Default,
}

/// Derived and ephemeral, never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EffectiveFlag {
    pub key: String,
    pub enabled: bool,
    pub source: FlagSource,
}

/// Merges the three sources with fixed precedence:
/// environment override > stored override > static default.
pub struct FlagResolver {
    defaults: Arc<StaticDefaultsTable>,
    env: EnvironmentOverrideResolver,
    store: Arc<dyn FlagStore>,
    cache: Arc<FlagCache>,
}

impl FlagResolver {
    pub fn new(
        defaults: Arc<StaticDefaultsTable>,
        env: EnvironmentOverrideResolver,
        store: Arc<dyn FlagStore>,
        cache: Arc<FlagCache>,
    ) -> Self {
        Self {
            defaults,
            env,
            store,
            cache,
        }
    }

    /// Resolution never fails: unknown keys and store outages both degrade to
    /// the static defaults (unknown keys to disabled).
    #[instrument(skip(self))]
    pub async fn resolve(&self, key: &str) -> EffectiveFlag {
        // Environment is authoritative and static for the process lifetime,
        // it bypasses both cache and store
        if let Some(enabled) = self.env.lookup(key) {
            return EffectiveFlag {
                key: key.to_string(),
                enabled,
                source: FlagSource::Env,
            };
        }

        let snapshot = self.snapshot().await;
        let enabled = snapshot.values.get(key).copied().unwrap_or(false);
        let source = if snapshot.overridden.contains(key) {
            FlagSource::Override
        } else {
            FlagSource::Default
        };
        EffectiveFlag {
            key: key.to_string(),
            enabled,
            source,
        }
    }

    /// The full resolved set, with environment overrides applied on top.
    pub async fn resolve_all(&self) -> HashMap<String, bool> {
        let snapshot = self.snapshot().await;
        let mut values = snapshot.values;
        for key in self.defaults.keys() {
            if let Some(enabled) = self.env.lookup(key) {
                values.insert(key.to_string(), enabled);
            }
        }
        values
    }

    async fn snapshot(&self) -> FlagSnapshot {
        if let Some(snapshot) = self.cache.get() {
            return snapshot;
        }
        // The generation is captured before the store read. If a mutation
        // invalidates the cache while the read is in flight, this snapshot
        // predates the write and must not be memoized over it.
        let generation = self.cache.generation();
        let snapshot = self.compute_snapshot().await;
        self.cache.put_if_current(snapshot.clone(), generation);
        snapshot
    }

    async fn compute_snapshot(&self) -> FlagSnapshot {
        let keys: Vec<String> = self.defaults.keys().map(|k| k.to_string()).collect();
        let overrides = match self.store.find_overrides(&keys).await {
            Ok(overrides) => overrides,
            Err(e) => {
                // A broken store degrades the product to all-defaults,
                // it never breaks resolution
                counter!("flags_store_fallback_total").increment(1);
                tracing::warn!("flag store unreachable, serving static defaults: {}", e);
                Vec::new()
            }
        };

        let mut values: HashMap<String, bool> = self
            .defaults
            .keys()
            .map(|key| (key.to_string(), self.defaults.default_enabled(key)))
            .collect();
        let mut overridden = HashSet::with_capacity(overrides.len());
        for o in overrides {
            values.insert(o.key.clone(), o.enabled);
            overridden.insert(o.key);
        }

        FlagSnapshot { values, overridden }
    }
}

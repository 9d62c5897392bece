use std::sync::Arc;

use metrics::counter;
use once_cell::sync::Lazy;
use regex::Regex;
use tracing::instrument;

use crate::api::{BatchOutcome, DeletedFlag, FlagError, FlagState};
use crate::broadcast::{FlagBroadcast, FlagChange};
use crate::cache::{FlagCache, FLAGS_CACHE_TAG};
use crate::defaults::{FlagCategory, StaticDefaultsTable};
use crate::identity::Actor;
use crate::store::{FlagStore, FlagUpdate, OverrideWrite};

static KEY_FORMAT: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[a-z][a-z0-9_-]{0,63}$").expect("flag key regex is valid"));

pub fn validate_key(key: &str) -> Result<(), FlagError> {
    if KEY_FORMAT.is_match(key) {
        Ok(())
    } else {
        Err(FlagError::InvalidKey(key.to_string()))
    }
}

/// Authorized writes against the flag store. Every successful mutation
/// invalidates the cache synchronously, then notifies live sessions.
pub struct MutationService {
    defaults: Arc<StaticDefaultsTable>,
    store: Arc<dyn FlagStore>,
    cache: Arc<FlagCache>,
    broadcast: FlagBroadcast,
}

impl MutationService {
    pub fn new(
        defaults: Arc<StaticDefaultsTable>,
        store: Arc<dyn FlagStore>,
        cache: Arc<FlagCache>,
        broadcast: FlagBroadcast,
    ) -> Self {
        Self {
            defaults,
            store,
            cache,
            broadcast,
        }
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub async fn toggle(&self, actor: &Actor, key: &str) -> Result<FlagState, FlagError> {
        actor.require_flag_admin()?;
        validate_key(key)?;

        // Negation happens inside the store, so concurrent toggles cannot
        // both read the same value and collapse into a duplicate write.
        // When no override exists the flag currently shows its default,
        // so the toggle inserts the negated default.
        let write = self.write_for(key, !self.defaults.default_enabled(key));
        let saved = self.store.toggle_or_insert(&write).await?;

        self.after_write(&saved.key, Some(saved.enabled));
        counter!("flags_mutations_total", "op" => "toggle").increment(1);

        Ok(FlagState {
            key: saved.key,
            enabled: saved.enabled,
        })
    }

    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub async fn set(&self, actor: &Actor, key: &str, enabled: bool) -> Result<FlagState, FlagError> {
        actor.require_flag_admin()?;
        validate_key(key)?;

        let saved = self.store.upsert(&self.write_for(key, enabled)).await?;

        self.after_write(&saved.key, Some(saved.enabled));
        counter!("flags_mutations_total", "op" => "set").increment(1);

        Ok(FlagState {
            key: saved.key,
            enabled: saved.enabled,
        })
    }

    #[instrument(skip_all, fields(actor_id = %actor.id, batch_size = updates.len()))]
    pub async fn batch_set(
        &self,
        actor: &Actor,
        updates: &[FlagUpdate],
    ) -> Result<BatchOutcome, FlagError> {
        actor.require_flag_admin()?;
        if updates.is_empty() {
            return Err(FlagError::EmptyBatch);
        }
        // The whole batch is rejected before any write begins
        for update in updates {
            validate_key(&update.key)?;
        }

        let writes: Vec<OverrideWrite> = updates
            .iter()
            .map(|u| self.write_for(&u.key, u.enabled))
            .collect();
        let updated = self.store.upsert_many(&writes).await?;

        self.cache.invalidate(FLAGS_CACHE_TAG);
        for update in updates {
            self.broadcast
                .publish(FlagChange::now(&update.key, Some(update.enabled)));
        }
        counter!("flags_mutations_total", "op" => "batch_set").increment(1);

        Ok(BatchOutcome {
            updated,
            total: updates.len(),
        })
    }

    /// Reverts the effective value to the static default (or the environment
    /// override, if one is set).
    #[instrument(skip(self, actor), fields(actor_id = %actor.id))]
    pub async fn delete_override(&self, actor: &Actor, key: &str) -> Result<DeletedFlag, FlagError> {
        actor.require_flag_admin()?;
        validate_key(key)?;

        let removed = self.store.delete(key).await?;

        // Deleting an override that was never set changes nothing; sessions
        // are not told to refetch over it
        if removed {
            self.after_write(key, None);
            counter!("flags_mutations_total", "op" => "delete_override").increment(1);
        }

        Ok(DeletedFlag {
            key: key.to_string(),
        })
    }

    fn write_for(&self, key: &str, enabled: bool) -> OverrideWrite {
        let category = self
            .defaults
            .get(key)
            .map(|d| d.category)
            .unwrap_or(FlagCategory::Experimental);
        OverrideWrite {
            key: key.to_string(),
            enabled,
            category,
        }
    }

    /// Cache invalidation completes before the mutation returns, so the
    /// mutator's own next read observes the write. The broadcast leg is
    /// fire-and-forget.
    fn after_write(&self, key: &str, enabled: Option<bool>) {
        self.cache.invalidate(FLAGS_CACHE_TAG);
        self.broadcast.publish(FlagChange::now(key, enabled));
    }
}

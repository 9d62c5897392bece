use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::broadcast::FlagBroadcast;
use crate::cache::FlagCache;
use crate::client::{ClientFlagStore, ClientSession, LocalBackend};
use crate::config::Config;
use crate::defaults::StaticDefaultsTable;
use crate::env_overrides::EnvironmentOverrideResolver;
use crate::identity::Actor;
use crate::mutation::MutationService;
use crate::resolver::FlagResolver;
use crate::router;
use crate::store::{FlagStore, MemoryFlagStore, PostgresFlagStore};

/// The assembled flag engine. The HTTP server is one consumer; embedders can
/// open in-process sessions against the same instance.
pub struct Engine {
    pub resolver: Arc<FlagResolver>,
    pub mutations: Arc<MutationService>,
    pub broadcast: FlagBroadcast,
    client_refresh_interval: Duration,
}

impl Engine {
    /// A per-session store with its broadcast listener and periodic refresh
    /// running, torn down when the returned session is dropped.
    pub fn open_session(&self, actor: Actor) -> ClientSession {
        let backend = LocalBackend::new(self.resolver.clone(), self.mutations.clone(), actor);
        let store = Arc::new(ClientFlagStore::new(Arc::new(backend)));
        ClientSession::start(store, &self.broadcast, self.client_refresh_interval)
    }
}

pub async fn build_engine(config: &Config) -> anyhow::Result<Engine> {
    let store: Arc<dyn FlagStore> = if config.use_memory_store {
        tracing::warn!("using in-memory flag store, overrides will not survive a restart");
        Arc::new(MemoryFlagStore::new())
    } else {
        let url = config.database_url.as_deref().ok_or_else(|| {
            anyhow::anyhow!("DATABASE_URL is required unless USE_MEMORY_STORE is set")
        })?;
        Arc::new(PostgresFlagStore::new(url).await?)
    };

    let defaults = Arc::new(StaticDefaultsTable::builtin());
    let cache = Arc::new(FlagCache::new(Duration::from_secs(config.cache_ttl_secs)));
    let broadcast = FlagBroadcast::new(config.broadcast_capacity);

    let resolver = Arc::new(FlagResolver::new(
        defaults.clone(),
        EnvironmentOverrideResolver::from_process_env(),
        store.clone(),
        cache.clone(),
    ));
    let mutations = Arc::new(MutationService::new(defaults, store, cache, broadcast.clone()));

    Ok(Engine {
        resolver,
        mutations,
        broadcast,
        client_refresh_interval: Duration::from_secs(config.client_refresh_interval_secs),
    })
}

pub async fn serve<F>(config: Config, listener: TcpListener, shutdown: F) -> anyhow::Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let engine = build_engine(&config).await?;
    let app = router::router(engine.resolver, engine.mutations, config.export_prometheus);

    tracing::info!("listening on {:?}", listener.local_addr()?);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await?;

    Ok(())
}

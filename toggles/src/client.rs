use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;

use crate::api::FlagError;
use crate::broadcast::{FlagBroadcast, FlagChange};
use crate::identity::Actor;
use crate::mutation::MutationService;
use crate::resolver::FlagResolver;
use crate::store::FlagUpdate;

/// The server boundary as seen from a session. An HTTP transport would
/// implement this over the flag routes; in-process consumers and tests use
/// [`LocalBackend`].
#[async_trait]
pub trait FlagsBackend: Send + Sync {
    async fn fetch_all(&self) -> Result<HashMap<String, bool>, FlagError>;
    async fn toggle(&self, key: &str) -> Result<(), FlagError>;
    async fn batch_set(&self, updates: &[FlagUpdate]) -> Result<(), FlagError>;
}

pub struct LocalBackend {
    resolver: Arc<FlagResolver>,
    mutations: Arc<MutationService>,
    actor: Actor,
}

impl LocalBackend {
    pub fn new(resolver: Arc<FlagResolver>, mutations: Arc<MutationService>, actor: Actor) -> Self {
        Self {
            resolver,
            mutations,
            actor,
        }
    }
}

#[async_trait]
impl FlagsBackend for LocalBackend {
    async fn fetch_all(&self) -> Result<HashMap<String, bool>, FlagError> {
        Ok(self.resolver.resolve_all().await)
    }

    async fn toggle(&self, key: &str) -> Result<(), FlagError> {
        self.mutations.toggle(&self.actor, key).await.map(|_| ())
    }

    async fn batch_set(&self, updates: &[FlagUpdate]) -> Result<(), FlagError> {
        self.mutations
            .batch_set(&self.actor, updates)
            .await
            .map(|_| ())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RefreshPhase {
    #[default]
    Idle,
    Refreshing,
    Error,
}

/// What a UI consumer observes: the last good snapshot plus refresh status.
/// A failed refresh keeps the stale values and stays usable.
#[derive(Debug, Clone, Default)]
pub struct FlagsView {
    pub values: HashMap<String, bool>,
    pub phase: RefreshPhase,
    pub error: Option<String>,
}

/// Per-session reactive cache of the resolved flag set. One instance per
/// session, injected where it is needed, never a process-global.
pub struct ClientFlagStore {
    backend: Arc<dyn FlagsBackend>,
    view: watch::Sender<FlagsView>,
    // One refresh at a time; latecomers wait and then run their own
    refresh_gate: Mutex<()>,
}

impl ClientFlagStore {
    pub fn new(backend: Arc<dyn FlagsBackend>) -> Self {
        let (view, _) = watch::channel(FlagsView::default());
        Self {
            backend,
            view,
            refresh_gate: Mutex::new(()),
        }
    }

    /// Unknown keys fail closed, mirroring server-side resolution.
    pub fn is_enabled(&self, key: &str) -> bool {
        self.view.borrow().values.get(key).copied().unwrap_or(false)
    }

    pub fn view(&self) -> FlagsView {
        self.view.borrow().clone()
    }

    /// Dropping the receiver unsubscribes.
    pub fn subscribe(&self) -> watch::Receiver<FlagsView> {
        self.view.subscribe()
    }

    pub async fn refresh(&self) {
        let _gate = self.refresh_gate.lock().await;
        self.view
            .send_modify(|v| v.phase = RefreshPhase::Refreshing);

        match self.backend.fetch_all().await {
            Ok(values) => self.view.send_modify(|v| {
                v.values = values;
                v.phase = RefreshPhase::Idle;
                v.error = None;
            }),
            Err(e) => {
                tracing::warn!("flag refresh failed, keeping stale snapshot: {}", e);
                self.view.send_modify(|v| {
                    v.phase = RefreshPhase::Error;
                    v.error = Some(e.to_string());
                });
            }
        }
    }

    /// No optimistic local flip: the mutation goes to the server and the
    /// authoritative result comes back through the unconditional refresh.
    pub async fn toggle(&self, key: &str) -> Result<(), FlagError> {
        let result = self.backend.toggle(key).await;
        self.refresh().await;
        result
    }

    pub async fn batch_update(&self, updates: &[FlagUpdate]) -> Result<(), FlagError> {
        let result = self.backend.batch_set(updates).await;
        self.refresh().await;
        result
    }
}

/// A running session: the store plus its two background companions, a
/// broadcast listener and a periodic refresh that bounds convergence for
/// sessions that miss broadcasts.
pub struct ClientSession {
    store: Arc<ClientFlagStore>,
    listener: JoinHandle<()>,
    refresher: JoinHandle<()>,
}

impl ClientSession {
    pub fn start(
        store: Arc<ClientFlagStore>,
        bus: &FlagBroadcast,
        refresh_interval: Duration,
    ) -> Self {
        let listener = tokio::spawn(listen_for_changes(store.clone(), bus.subscribe()));
        let refresher = tokio::spawn(refresh_periodically(store.clone(), refresh_interval));
        Self {
            store,
            listener,
            refresher,
        }
    }

    pub fn store(&self) -> &Arc<ClientFlagStore> {
        &self.store
    }

    pub fn close(&self) {
        self.listener.abort();
        self.refresher.abort();
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

async fn listen_for_changes(
    store: Arc<ClientFlagStore>,
    mut rx: broadcast::Receiver<FlagChange>,
) {
    loop {
        match rx.recv().await {
            Ok(change) => {
                tracing::debug!(flag_key = %change.flag_key, "flag change received, refreshing");
                store.refresh().await;
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                // Missed messages are not replayed, one refresh re-converges
                tracing::warn!(skipped, "session lagged behind flag broadcasts");
                store.refresh().await;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn refresh_periodically(store: Arc<ClientFlagStore>, every: Duration) {
    let mut interval = tokio::time::interval(every);
    // The first tick completes immediately
    interval.tick().await;
    loop {
        interval.tick().await;
        store.refresh().await;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::store::StoreError;

    #[derive(Default)]
    struct ScriptedBackend {
        flags: std::sync::Mutex<HashMap<String, bool>>,
        fail_fetches: std::sync::atomic::AtomicBool,
        fetches: AtomicUsize,
    }

    impl ScriptedBackend {
        fn with_flag(key: &str, enabled: bool) -> Self {
            let backend = Self::default();
            backend
                .flags
                .lock()
                .unwrap()
                .insert(key.to_string(), enabled);
            backend
        }
    }

    #[async_trait]
    impl FlagsBackend for ScriptedBackend {
        async fn fetch_all(&self) -> Result<HashMap<String, bool>, FlagError> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.fail_fetches.load(Ordering::SeqCst) {
                return Err(FlagError::StoreUnavailable(StoreError::Unavailable));
            }
            Ok(self.flags.lock().unwrap().clone())
        }

        async fn toggle(&self, key: &str) -> Result<(), FlagError> {
            let mut flags = self.flags.lock().unwrap();
            let entry = flags.entry(key.to_string()).or_insert(false);
            *entry = !*entry;
            Ok(())
        }

        async fn batch_set(&self, updates: &[FlagUpdate]) -> Result<(), FlagError> {
            let mut flags = self.flags.lock().unwrap();
            for update in updates {
                flags.insert(update.key.clone(), update.enabled);
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn refresh_populates_the_snapshot() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", true));
        let store = ClientFlagStore::new(backend);

        assert!(!store.is_enabled("dark-mode"));
        store.refresh().await;
        assert!(store.is_enabled("dark-mode"));
        assert_eq!(store.view().phase, RefreshPhase::Idle);
    }

    #[tokio::test]
    async fn unknown_keys_read_as_disabled() {
        let store = ClientFlagStore::new(Arc::new(ScriptedBackend::default()));
        store.refresh().await;
        assert!(!store.is_enabled("never-heard-of-it"));
    }

    #[tokio::test]
    async fn toggle_refetches_the_authoritative_result() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", false));
        let store = ClientFlagStore::new(backend.clone());
        store.refresh().await;

        store.toggle("dark-mode").await.unwrap();
        assert!(store.is_enabled("dark-mode"));
        // initial refresh plus the one the toggle triggered
        assert_eq!(backend.fetches.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_the_stale_snapshot() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", true));
        let store = ClientFlagStore::new(backend.clone());
        store.refresh().await;

        backend.fail_fetches.store(true, Ordering::SeqCst);
        store.refresh().await;

        let view = store.view();
        assert_eq!(view.phase, RefreshPhase::Error);
        assert!(view.error.is_some());
        // Stale but usable
        assert!(store.is_enabled("dark-mode"));
    }

    #[tokio::test]
    async fn batch_update_applies_and_refreshes() {
        let backend = Arc::new(ScriptedBackend::default());
        let store = ClientFlagStore::new(backend);

        store
            .batch_update(&[
                FlagUpdate {
                    key: "dark-mode".to_string(),
                    enabled: true,
                },
                FlagUpdate {
                    key: "new-checkout".to_string(),
                    enabled: true,
                },
            ])
            .await
            .unwrap();

        assert!(store.is_enabled("dark-mode"));
        assert!(store.is_enabled("new-checkout"));
    }

    #[tokio::test]
    async fn subscribers_observe_refreshes() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", true));
        let store = ClientFlagStore::new(backend);
        let mut rx = store.subscribe();

        store.refresh().await;
        let view = rx
            .wait_for(|v| v.phase == RefreshPhase::Idle && !v.values.is_empty())
            .await
            .unwrap()
            .clone();
        assert_eq!(view.values["dark-mode"], true);
    }

    #[tokio::test]
    async fn broadcast_receipt_triggers_a_session_refresh() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", true));
        let store = Arc::new(ClientFlagStore::new(backend));
        let bus = FlagBroadcast::default();
        let session = ClientSession::start(store.clone(), &bus, Duration::from_secs(3600));
        let mut rx = store.subscribe();

        bus.publish(FlagChange::now("dark-mode", Some(true)));

        let view = tokio::time::timeout(
            Duration::from_secs(5),
            rx.wait_for(|v| !v.values.is_empty()),
        )
        .await
        .expect("session never refreshed")
        .unwrap()
        .clone();
        assert!(view.values["dark-mode"]);
        session.close();
    }

    #[tokio::test(start_paused = true)]
    async fn periodic_refresh_converges_sessions_that_missed_broadcasts() {
        let backend = Arc::new(ScriptedBackend::with_flag("dark-mode", true));
        let store = Arc::new(ClientFlagStore::new(backend.clone()));
        let bus = FlagBroadcast::default();
        // No broadcast is ever published; only the interval drives refreshes
        let _session = ClientSession::start(store.clone(), &bus, Duration::from_secs(60));
        let mut rx = store.subscribe();

        tokio::time::advance(Duration::from_secs(61)).await;

        let view = rx.wait_for(|v| !v.values.is_empty()).await.unwrap().clone();
        assert!(view.values["dark-mode"]);
        assert!(backend.fetches.load(Ordering::SeqCst) >= 1);
    }
}

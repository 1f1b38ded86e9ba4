//! Process-wide orchestration context.
//!
//! [`Orchestrator`] owns the singletons (cache, state store, reload
//! guard, poller, executor) and is the documented init/shutdown
//! lifecycle around them. Hosts construct exactly one per process, call
//! [`init`](Orchestrator::init) at startup and
//! [`shutdown`](Orchestrator::shutdown) at teardown, and reach the
//! components only through its handles.

use std::sync::Arc;

use crate::bridge::KernelBridge;
use crate::cache::TtlCache;
use crate::config::OrchestratorConfig;
use crate::error::Result;
use crate::guard::ReloadGuard;
use crate::poll::CompletionPoller;
use crate::run::{RunCallback, SequentialExecutor};
use crate::store::StateStore;
use crate::types::{ExecutionUnit, ResourceId};

/// Owner of the orchestration subsystem.
pub struct Orchestrator {
    config: OrchestratorConfig,
    cache: Arc<TtlCache>,
    store: StateStore,
    guard: Arc<ReloadGuard>,
    poller: Arc<CompletionPoller>,
    executor: Arc<SequentialExecutor>,
}

impl Orchestrator {
    /// Wire up the subsystem over a host-provided bridge.
    pub fn new(bridge: Arc<dyn KernelBridge>, config: OrchestratorConfig) -> Self {
        Self::with_callback(bridge, config, Arc::new(crate::run::SilentCallback))
    }

    /// Wire up the subsystem with a run-progress callback.
    pub fn with_callback(
        bridge: Arc<dyn KernelBridge>,
        config: OrchestratorConfig,
        callback: Arc<dyn RunCallback>,
    ) -> Self {
        let cache = Arc::new(TtlCache::new(config.ttl_rules.clone(), config.default_ttl));
        let store = StateStore::new(&config.state_path, config.flush_debounce);
        let guard = Arc::new(ReloadGuard::new(Arc::clone(&bridge), &config));
        let poller = Arc::new(CompletionPoller::new(Arc::clone(&bridge), &config));
        let executor = Arc::new(
            SequentialExecutor::new(Arc::clone(&bridge), Arc::clone(&poller), &config)
                .with_callback(callback),
        );

        Self {
            config,
            cache,
            store,
            guard,
            poller,
            executor,
        }
    }

    /// Load persisted state. Call once at process start.
    pub fn init(&self) -> usize {
        self.store.load()
    }

    /// Start a sequential run of ordered units for a resource.
    pub fn run_all(&self, resource: ResourceId, units: Vec<ExecutionUnit>) -> Result<()> {
        self.executor.run_all(resource, units)
    }

    /// Run a guarded document reload. Returns whether a reload actually
    /// happened (`false` means the guard suppressed it).
    pub fn reload(&self, resource: ResourceId) -> Result<bool> {
        self.guard.reload(resource)
    }

    /// Notify that a document was (re-)entered.
    ///
    /// The kernel may have recreated its annotation channel, so the
    /// cached channel identity is dropped and re-resolved lazily.
    pub fn resource_opened(&self, resource: ResourceId) {
        self.poller.invalidate_channel(resource);
    }

    /// Notify that a document was destroyed.
    pub fn resource_closed(&self, resource: ResourceId) {
        self.guard.forget_resource(resource);
        self.poller.invalidate_channel(resource);
    }

    /// Flush pending state and release timers. Call once at teardown.
    pub fn shutdown(&self) -> Result<()> {
        self.store.cleanup()
    }

    /// The shared TTL cache.
    pub fn cache(&self) -> &Arc<TtlCache> {
        &self.cache
    }

    /// The durable state store.
    pub fn store(&self) -> &StateStore {
        &self.store
    }

    /// The reload guard.
    pub fn guard(&self) -> &Arc<ReloadGuard> {
        &self.guard
    }

    /// The completion poller.
    pub fn poller(&self) -> &Arc<CompletionPoller> {
        &self.poller
    }

    /// The active configuration.
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }
}

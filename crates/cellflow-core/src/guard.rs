//! Reentrancy guarding for document reload pipelines.
//!
//! The kernel's background tick loop can observe a reload's intermediate
//! state and schedule another reload of the same document, cascading into
//! unbounded call depth. [`ReloadGuard`] breaks the cascade with a global
//! lock, per-resource locks, a debounce window, and a hard depth ceiling.
//! While any permit is held the kernel's tick rate is lowered to a safe
//! value and restored exactly once when the last permit is released.
//!
//! Not a general-purpose lock: the depth ceiling and explicit reset
//! exist to break the tick-loop cascade, nothing else.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::bridge::KernelBridge;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::types::ResourceId;

#[derive(Debug)]
struct GuardState {
    global_lock: bool,
    locked: HashSet<ResourceId>,
    depth: u32,
    last_action: Option<Instant>,
    saved_throttle: Option<u64>,
}

impl GuardState {
    fn new() -> Self {
        Self {
            global_lock: false,
            locked: HashSet::new(),
            depth: 0,
            last_action: None,
            saved_throttle: None,
        }
    }
}

/// Global + per-resource mutual exclusion around reload operations.
///
/// Invariant: `global_lock == (depth > 0)`, and `saved_throttle` is set
/// only while `depth > 0`.
pub struct ReloadGuard {
    bridge: Arc<dyn KernelBridge>,
    state: Mutex<GuardState>,
    debounce: Duration,
    max_depth: u32,
    guarded_tick_ms: u64,
}

impl ReloadGuard {
    /// Create a guard over the given kernel bridge.
    pub fn new(bridge: Arc<dyn KernelBridge>, config: &OrchestratorConfig) -> Self {
        Self {
            bridge,
            state: Mutex::new(GuardState::new()),
            debounce: config.guard_debounce,
            max_depth: config.max_reload_depth,
            guarded_tick_ms: config.guarded_tick_interval_ms,
        }
    }

    /// Whether a new guarded entry may proceed for this resource.
    ///
    /// False while the global lock is held, while the resource holds a
    /// per-resource lock, within the debounce window of the last action,
    /// or at the depth ceiling (which raises a terminal warning). A `true`
    /// result records the action time, so rapid repeated queries debounce
    /// each other.
    pub fn can_enter(&self, resource: ResourceId) -> bool {
        let mut state = self.lock();

        if state.global_lock {
            tracing::debug!("Guard busy: global lock held, resource {}", resource);
            return false;
        }
        if state.locked.contains(&resource) {
            tracing::debug!("Guard busy: resource {} locked", resource);
            return false;
        }
        if let Some(last) = state.last_action
            && last.elapsed() < self.debounce
        {
            tracing::debug!("Guard debounced for resource {}", resource);
            return false;
        }
        if state.depth >= self.max_depth {
            tracing::warn!(
                "Reload recursion limit reached for resource {} (depth {}, max {}); \
                 refusing entry until force_reset",
                resource,
                state.depth,
                self.max_depth
            );
            return false;
        }

        state.last_action = Some(Instant::now());
        true
    }

    /// Enter a guarded section for the resource.
    ///
    /// On the first entry the kernel tick interval is saved and lowered.
    /// The returned permit releases on drop; every `begin` is matched by
    /// exactly one release.
    pub fn begin(self: &Arc<Self>, resource: ResourceId) -> Result<ReloadPermit> {
        let first_entry = {
            let mut state = self.lock();

            if state.depth >= self.max_depth {
                tracing::warn!(
                    "Aborting reload of resource {}: recursion limit hit (depth {})",
                    resource,
                    state.depth
                );
                return Err(Error::RecursionLimitExceeded {
                    resource,
                    depth: state.depth,
                    max: self.max_depth,
                });
            }

            state.depth += 1;
            state.global_lock = true;
            state.last_action = Some(Instant::now());
            state.locked.insert(resource);
            state.depth == 1
        };

        if first_entry {
            // Slow the kernel's tick loop so it cannot observe the reload
            // mid-flight and schedule another one.
            let saved = self.bridge.tick_interval();
            self.bridge.set_tick_interval(self.guarded_tick_ms);
            self.lock().saved_throttle = Some(saved);
            tracing::debug!(
                "Guard entered for resource {}; tick {}ms -> {}ms",
                resource,
                saved,
                self.guarded_tick_ms
            );
        }

        Ok(ReloadPermit {
            guard: Arc::clone(self),
            resource,
            released: false,
        })
    }

    /// Leave a guarded section for the resource.
    ///
    /// Prefer letting the [`ReloadPermit`] drop; this is the explicit
    /// matching call for hosts that cannot hold the permit.
    pub fn end(&self, resource: ResourceId) {
        let restore = {
            let mut state = self.lock();
            state.locked.remove(&resource);
            state.depth = state.depth.saturating_sub(1);
            if state.depth == 0 {
                state.global_lock = false;
                state.saved_throttle.take()
            } else {
                None
            }
        };

        if let Some(saved) = restore {
            self.bridge.set_tick_interval(saved);
            tracing::debug!("Guard released for resource {}; tick restored to {}ms", resource, saved);
        }
    }

    /// Emergency clear of all locks and depth.
    ///
    /// Operator action after detected corruption; never invoked
    /// automatically. Resets the debounce state so the very next
    /// `can_enter` is not blocked, and restores any saved throttle.
    pub fn force_reset(&self) {
        let restore = {
            let mut state = self.lock();
            tracing::warn!(
                "Force-resetting reload guard (depth was {}, {} locked resources)",
                state.depth,
                state.locked.len()
            );
            let saved = state.saved_throttle.take();
            *state = GuardState::new();
            saved
        };

        if let Some(saved) = restore {
            self.bridge.set_tick_interval(saved);
        }
    }

    /// Drop the per-resource lock entry for a destroyed resource.
    ///
    /// Driven by an external lifecycle notification so the lock set does
    /// not grow without bound.
    pub fn forget_resource(&self, resource: ResourceId) {
        let mut state = self.lock();
        if state.locked.remove(&resource) {
            tracing::debug!("Forgot guard entry for destroyed resource {}", resource);
        }
    }

    /// Current recursion depth.
    pub fn depth(&self) -> u32 {
        self.lock().depth
    }

    /// Whether no guarded section is active.
    pub fn is_idle(&self) -> bool {
        let state = self.lock();
        debug_assert_eq!(state.global_lock, state.depth > 0);
        state.depth == 0
    }

    /// Run a guarded document reload.
    ///
    /// Returns `Ok(false)` when the guard suppressed the reload (busy or
    /// debounced); the caller simply skips, which is what breaks the tick
    /// loop cascade.
    pub fn reload(self: &Arc<Self>, resource: ResourceId) -> Result<bool> {
        if !self.can_enter(resource) {
            return Ok(false);
        }

        let permit = self.begin(resource)?;
        let result = permit.guard.bridge.reload_document(resource);
        permit.release();
        result.map(|_| true)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, GuardState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// RAII handle for one guarded entry.
///
/// Releases the guard on drop; [`release`](Self::release) makes the
/// release point explicit.
pub struct ReloadPermit {
    guard: Arc<ReloadGuard>,
    resource: ResourceId,
    released: bool,
}

impl ReloadPermit {
    /// Explicitly release the permit.
    pub fn release(mut self) {
        self.released = true;
        self.guard.end(self.resource);
    }

    /// The resource this permit covers.
    pub fn resource(&self) -> ResourceId {
        self.resource
    }
}

impl Drop for ReloadPermit {
    fn drop(&mut self) {
        if !self.released {
            self.guard.end(self.resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::UnitSource;
    use crate::types::{ChannelInfo, CompletionSignal};
    use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

    /// Minimal bridge: only the tick-rate and reload surface matter here.
    struct StubBridge {
        tick_ms: AtomicU64,
        reloads: AtomicUsize,
    }

    impl StubBridge {
        fn new(tick_ms: u64) -> Self {
            Self {
                tick_ms: AtomicU64::new(tick_ms),
                reloads: AtomicUsize::new(0),
            }
        }
    }

    impl KernelBridge for StubBridge {
        fn dispatch(&self, _resource: ResourceId, _source: &str) -> Result<()> {
            Ok(())
        }
        fn resource_exists(&self, _resource: ResourceId) -> bool {
            true
        }
        fn channels(&self, _resource: ResourceId) -> Vec<ChannelInfo> {
            Vec::new()
        }
        fn signals(&self, _resource: ResourceId, _channel: u64) -> Result<Vec<CompletionSignal>> {
            Ok(Vec::new())
        }
        fn locate_unit(&self, _resource: ResourceId, _index: u32) -> Result<Option<UnitSource>> {
            Ok(None)
        }
        fn focus_unit(&self, _resource: ResourceId, _index: u32) -> Result<()> {
            Ok(())
        }
        fn reload_document(&self, _resource: ResourceId) -> Result<()> {
            self.reloads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn tick_interval(&self) -> u64 {
            self.tick_ms.load(Ordering::SeqCst)
        }
        fn set_tick_interval(&self, millis: u64) {
            self.tick_ms.store(millis, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<ReloadGuard>, Arc<StubBridge>) {
        let bridge = Arc::new(StubBridge::new(500));
        let guard = Arc::new(ReloadGuard::new(
            bridge.clone(),
            &OrchestratorConfig::default(),
        ));
        (guard, bridge)
    }

    #[test]
    fn test_nested_begin_release_symmetry() {
        let (guard, bridge) = setup();
        let resource = ResourceId::new(1);

        let permits: Vec<_> = (0..3).map(|_| guard.begin(resource).unwrap()).collect();
        assert_eq!(guard.depth(), 3);
        assert!(!guard.is_idle());
        // Throttle lowered once, on first entry.
        assert_eq!(bridge.tick_interval(), 2_000);

        for permit in permits {
            permit.release();
        }
        assert_eq!(guard.depth(), 0);
        assert!(guard.is_idle());
    }

    #[test]
    fn test_throttle_round_trip() {
        let (guard, bridge) = setup();
        let resource = ResourceId::new(1);
        assert_eq!(bridge.tick_interval(), 500);

        let outer = guard.begin(resource).unwrap();
        let inner = guard.begin(resource).unwrap();
        assert_eq!(bridge.tick_interval(), 2_000);

        inner.release();
        // Still guarded; throttle not yet restored.
        assert_eq!(bridge.tick_interval(), 2_000);

        outer.release();
        assert_eq!(bridge.tick_interval(), 500);
    }

    #[test]
    fn test_permit_releases_on_drop() {
        let (guard, bridge) = setup();
        {
            let _permit = guard.begin(ResourceId::new(1)).unwrap();
            assert_eq!(guard.depth(), 1);
        }
        assert!(guard.is_idle());
        assert_eq!(bridge.tick_interval(), 500);
    }

    #[test]
    fn test_depth_ceiling_aborts_begin() {
        let (guard, _bridge) = setup();
        let resource = ResourceId::new(1);

        let _permits: Vec<_> = (0..5).map(|_| guard.begin(resource).unwrap()).collect();
        // ReloadPermit is not Debug, so pull the error out by hand.
        let Err(err) = guard.begin(resource) else {
            panic!("begin past the ceiling should fail");
        };
        assert!(matches!(
            err,
            Error::RecursionLimitExceeded { depth: 5, max: 5, .. }
        ));
    }

    #[test]
    fn test_can_enter_debounces_repeated_calls() {
        let (guard, _bridge) = setup();
        let resource = ResourceId::new(1);

        assert!(guard.can_enter(resource));
        // Second query lands inside the 500ms window.
        assert!(!guard.can_enter(resource));
    }

    #[test]
    fn test_can_enter_false_while_guarded() {
        let (guard, _bridge) = setup();
        let resource = ResourceId::new(1);
        let other = ResourceId::new(2);

        let permit = guard.begin(resource).unwrap();
        // Global lock blocks every resource, not just the locked one.
        assert!(!guard.can_enter(resource));
        assert!(!guard.can_enter(other));
        permit.release();
    }

    #[test]
    fn test_force_reset_unblocks_immediately() {
        let (guard, bridge) = setup();
        let resource = ResourceId::new(1);

        let permit = guard.begin(resource).unwrap();
        let _nested = guard.begin(resource).unwrap();
        assert!(!guard.can_enter(resource));

        guard.force_reset();
        assert!(guard.is_idle());
        assert_eq!(bridge.tick_interval(), 500);
        // Debounce state was cleared too.
        assert!(guard.can_enter(resource));

        // Permits from before the reset must not underflow depth.
        permit.release();
        assert_eq!(guard.depth(), 0);
    }

    #[test]
    fn test_forget_resource_drops_lock_entry() {
        let (guard, _bridge) = setup();
        let resource = ResourceId::new(1);

        let permit = guard.begin(resource).unwrap();
        guard.forget_resource(resource);
        assert!(!guard.lock().locked.contains(&resource));
        permit.release();
    }

    #[test]
    fn test_guarded_reload_runs_and_suppresses() {
        let (guard, bridge) = setup();
        let resource = ResourceId::new(1);

        assert!(guard.reload(resource).unwrap());
        assert_eq!(bridge.reloads.load(Ordering::SeqCst), 1);
        // Tick restored after the reload.
        assert_eq!(bridge.tick_interval(), 500);

        // Immediately retriggering lands in the debounce window.
        assert!(!guard.reload(resource).unwrap());
        assert_eq!(bridge.reloads.load(Ordering::SeqCst), 1);
    }
}

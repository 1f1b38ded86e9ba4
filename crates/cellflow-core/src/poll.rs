//! Completion polling against the kernel's annotation channel.
//!
//! The kernel offers no completion callback; the only evidence that a
//! unit finished is a marker it writes into an annotation channel on the
//! document. [`CompletionPoller`] samples that channel on a fixed
//! interval and reports whether a *new* completed id (strictly greater
//! than the caller's baseline) has appeared, with a bounded timeout and
//! graceful degradation when the buffer disappears.
//!
//! The poller is one strategy behind a small surface; if the kernel ever
//! grows a completion event, an event-driven watcher can replace it
//! without touching the executor.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::time::Instant;

use crate::bridge::{ChannelId, KernelBridge};
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::types::{ResourceId, SignalStatus};

/// Terminal state of one completion wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A completed id above the baseline appeared.
    Completed,
    /// The ceiling elapsed; the caller degrades and continues.
    TimedOut,
    /// The resource disappeared mid-wait; the caller aborts silently.
    BufferInvalid,
}

/// Periodic watcher over the output marker channel.
pub struct CompletionPoller {
    bridge: Arc<dyn KernelBridge>,
    channel_name: String,
    poll_interval: Duration,
    timeout: Duration,
    /// Resolved channel identity per resource. Invalidated on document
    /// re-entry because the kernel may recreate the channel with a new
    /// identity after a restart.
    channel_ids: Mutex<HashMap<ResourceId, ChannelId>>,
    /// Resources with a wait in flight; one timer per resource.
    active: Mutex<HashSet<ResourceId>>,
    /// Resources whose missing channel has already been warned about.
    /// Each poll tick retries resolution, so without this a single
    /// unresolvable channel would warn once per interval for the whole
    /// wait. Cleared when the channel resolves or is invalidated.
    warned_missing: Mutex<HashSet<ResourceId>>,
}

impl CompletionPoller {
    /// Create a poller over the given bridge.
    pub fn new(bridge: Arc<dyn KernelBridge>, config: &OrchestratorConfig) -> Self {
        Self {
            bridge,
            channel_name: config.output_channel.clone(),
            poll_interval: config.poll_interval,
            timeout: config.completion_timeout,
            channel_ids: Mutex::new(HashMap::new()),
            active: Mutex::new(HashSet::new()),
            warned_missing: Mutex::new(HashSet::new()),
        }
    }

    /// Resolve the output marker channel for a resource.
    ///
    /// Matches the channel name exactly; a sibling channel with a similar
    /// prefix (e.g. a highlighting namespace) must never be selected, or
    /// every wait would time out. The resolved identity is cached.
    pub fn resolve_channel(&self, resource: ResourceId) -> Result<ChannelId> {
        if let Some(id) = self.lock_channels().get(&resource).copied() {
            return Ok(id);
        }

        let resolved = self
            .bridge
            .channels(resource)
            .into_iter()
            .find(|channel| channel.name == self.channel_name)
            .map(|channel| channel.id)
            .ok_or(Error::ChannelNotFound(resource));

        let resolved = match resolved {
            Ok(id) => id,
            Err(e) => {
                if self.lock_warned().insert(resource) {
                    tracing::warn!(
                        "Channel '{}' not found for resource {}",
                        self.channel_name,
                        resource
                    );
                } else {
                    tracing::debug!(
                        "Channel '{}' still missing for resource {}",
                        self.channel_name,
                        resource
                    );
                }
                return Err(e);
            }
        };

        self.lock_warned().remove(&resource);
        self.lock_channels().insert(resource, resolved);
        tracing::debug!(
            "Resolved channel '{}' for resource {} -> {}",
            self.channel_name,
            resource,
            resolved
        );
        Ok(resolved)
    }

    /// Drop the cached channel identity for a resource.
    ///
    /// Called whenever the document is re-entered.
    pub fn invalidate_channel(&self, resource: ResourceId) {
        self.lock_warned().remove(&resource);
        if self.lock_channels().remove(&resource).is_some() {
            tracing::debug!("Invalidated channel cache for resource {}", resource);
        }
    }

    /// Highest completed unit id currently visible for a resource.
    ///
    /// Returns 0 when no signal is present or the channel cannot be
    /// resolved; completion checks then degrade to "never complete"
    /// until the channel is re-resolved.
    pub fn current_completed(&self, resource: ResourceId) -> u64 {
        let channel = match self.resolve_channel(resource) {
            Ok(channel) => channel,
            // resolve_channel already logged the miss once.
            Err(_) => return 0,
        };

        match self.bridge.signals(resource, channel) {
            Ok(signals) => signals
                .iter()
                .filter(|signal| signal.status == SignalStatus::Done)
                .map(|signal| signal.unit_id)
                .max()
                .unwrap_or(0),
            Err(e) => {
                tracing::warn!("Signal query failed for resource {}: {}", resource, e);
                0
            }
        }
    }

    /// Wait until a completed id strictly greater than `baseline` appears.
    ///
    /// Polls on a fixed interval; resolves to [`WaitOutcome::BufferInvalid`]
    /// when the resource is gone and [`WaitOutcome::TimedOut`] past the
    /// ceiling. Starting a second wait for the same resource is a caller
    /// error.
    pub async fn wait_for_completion(
        &self,
        resource: ResourceId,
        baseline: u64,
    ) -> Result<WaitOutcome> {
        {
            let mut active = self.lock_active();
            if !active.insert(resource) {
                return Err(Error::WaitInProgress(resource));
            }
        }
        let _slot = ActiveSlot {
            poller: self,
            resource,
        };

        let started = Instant::now();
        let mut ticks = tokio::time::interval(self.poll_interval);
        ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a just-dispatched
        // unit gets one full interval before the first sample.
        ticks.tick().await;

        loop {
            ticks.tick().await;

            if !self.bridge.resource_exists(resource) {
                tracing::debug!("Wait aborted: resource {} gone", resource);
                return Ok(WaitOutcome::BufferInvalid);
            }

            if started.elapsed() >= self.timeout {
                tracing::info!(
                    "Completion wait for resource {} timed out after {:?} (baseline {})",
                    resource,
                    self.timeout,
                    baseline
                );
                return Ok(WaitOutcome::TimedOut);
            }

            if self.current_completed(resource) > baseline {
                return Ok(WaitOutcome::Completed);
            }
        }
    }

    fn lock_channels(&self) -> std::sync::MutexGuard<'_, HashMap<ResourceId, ChannelId>> {
        self.channel_ids.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<ResourceId>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn lock_warned(&self) -> std::sync::MutexGuard<'_, HashSet<ResourceId>> {
        self.warned_missing.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Deregisters the in-flight wait even if the future is dropped.
struct ActiveSlot<'a> {
    poller: &'a CompletionPoller,
    resource: ResourceId,
}

impl Drop for ActiveSlot<'_> {
    fn drop(&mut self) {
        self.poller.lock_active().remove(&self.resource);
    }
}

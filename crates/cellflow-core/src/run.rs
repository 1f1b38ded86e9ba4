//! Sequential multi-unit execution.
//!
//! Drives a "run all" request: units are dispatched strictly in document
//! order, one at a time, each awaited through the completion poller
//! before the next dispatch. A timed-out unit is logged and skipped past
//! (degrade and continue); a vanished buffer aborts the run silently.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::bridge::KernelBridge;
use crate::config::OrchestratorConfig;
use crate::error::{Error, Result};
use crate::poll::{CompletionPoller, WaitOutcome};
use crate::types::{ExecutionRun, ExecutionUnit, ResourceId};

/// Progress reporting for a run.
///
/// All methods have no-op defaults; hosts implement what they surface.
pub trait RunCallback: Send + Sync {
    /// A unit is about to be dispatched.
    fn on_unit_started(&self, _resource: ResourceId, _unit: &ExecutionUnit) {}
    /// A unit signalled completion.
    fn on_unit_completed(&self, _resource: ResourceId, _index: u32) {}
    /// A unit hit the ceiling; the run continues.
    fn on_unit_timeout(&self, _resource: ResourceId, _index: u32) {}
    /// A markdown or empty unit was processed without dispatch.
    fn on_unit_skipped(&self, _resource: ResourceId, _index: u32) {}
    /// The run finished; `completed`/`timed_out` count driven code units.
    fn on_run_completed(&self, _resource: ResourceId, _completed: u32, _timed_out: u32) {}
    /// A run request was rejected because one is already active.
    fn on_run_rejected(&self, _resource: ResourceId) {}
    /// The run aborted because the resource disappeared.
    fn on_run_aborted(&self, _resource: ResourceId) {}
}

/// No-op callback for hosts that do not surface progress.
pub struct SilentCallback;

impl RunCallback for SilentCallback {}

/// Orchestrates sequential execution of ordered units.
pub struct SequentialExecutor {
    bridge: Arc<dyn KernelBridge>,
    poller: Arc<CompletionPoller>,
    callback: Arc<dyn RunCallback>,
    settle_delay: Duration,
    /// Resources with a run in flight.
    active: Mutex<HashSet<ResourceId>>,
}

impl SequentialExecutor {
    /// Create an executor over the given bridge and poller.
    pub fn new(
        bridge: Arc<dyn KernelBridge>,
        poller: Arc<CompletionPoller>,
        config: &OrchestratorConfig,
    ) -> Self {
        Self {
            bridge,
            poller,
            callback: Arc::new(SilentCallback),
            settle_delay: config.settle_delay,
            active: Mutex::new(HashSet::new()),
        }
    }

    /// Attach a progress callback.
    pub fn with_callback(mut self, callback: Arc<dyn RunCallback>) -> Self {
        self.callback = callback;
        self
    }

    /// Whether a run is in flight for the resource.
    pub fn is_running(&self, resource: ResourceId) -> bool {
        self.lock_active().contains(&resource)
    }

    /// Start a run of ordered units. Fire-and-forget: progress surfaces
    /// through the [`RunCallback`], not a return value.
    ///
    /// Rejected with a warning when a run is already active for the
    /// resource.
    pub fn run_all(self: &Arc<Self>, resource: ResourceId, units: Vec<ExecutionUnit>) -> Result<()> {
        {
            let mut active = self.lock_active();
            if !active.insert(resource) {
                tracing::warn!("Rejecting run for resource {}: already in progress", resource);
                self.callback.on_run_rejected(resource);
                return Err(Error::RunInProgress(resource));
            }
        }

        let executor = Arc::clone(self);
        tokio::spawn(async move {
            executor.drive_run(resource, units).await;
            executor.lock_active().remove(&resource);
        });
        Ok(())
    }

    /// Drive one run to completion or abort.
    ///
    /// Internal failures are converted into per-unit continue-or-abort
    /// decisions; nothing escapes to kill the event loop.
    async fn drive_run(&self, resource: ResourceId, units: Vec<ExecutionUnit>) {
        let baseline = self.poller.current_completed(resource);
        let mut run = ExecutionRun::new(units.len() as u32, baseline);
        tracing::info!(
            "Starting run of {} units for resource {} (baseline {})",
            run.total_units,
            resource,
            baseline
        );

        for unit in &units {
            run.current_index = unit.index;

            if !self.drive_unit(resource, unit, &mut run).await {
                self.callback.on_run_aborted(resource);
                tracing::debug!("Run aborted for resource {}", resource);
                return;
            }
            run.advance();
        }

        // Leave the cursor on the last unit rather than wherever the
        // final navigation landed.
        if run.total_units > 0
            && let Err(e) = self.bridge.focus_unit(resource, run.total_units)
        {
            tracing::debug!("Final focus failed for resource {}: {}", resource, e);
        }

        tracing::info!(
            "Run complete for resource {}: {} completed, {} timed out",
            resource,
            run.completed,
            run.timed_out
        );
        self.callback.on_run_completed(resource, run.completed, run.timed_out);
    }

    /// Drive a single unit. Returns `false` when the run must abort.
    async fn drive_unit(
        &self,
        resource: ResourceId,
        unit: &ExecutionUnit,
        run: &mut ExecutionRun,
    ) -> bool {
        // Re-locate from the live document: earlier units may have grown
        // or shrunk the buffer, so positions captured at run start are
        // stale. Counting markers from the top is the only stable way in.
        let source = match self.bridge.locate_unit(resource, unit.index) {
            Ok(Some(source)) => source,
            Ok(None) => {
                if !self.bridge.resource_exists(resource) {
                    return false;
                }
                tracing::debug!(
                    "Unit {} no longer present in resource {}; skipping",
                    unit.index,
                    resource
                );
                self.callback.on_unit_skipped(resource, unit.index);
                return true;
            }
            Err(e) => {
                tracing::warn!("Failed to locate unit {}: {}", unit.index, e);
                self.callback.on_unit_skipped(resource, unit.index);
                return true;
            }
        };

        if let Err(e) = self.bridge.focus_unit(resource, unit.index) {
            tracing::debug!("Focus failed for unit {}: {}", unit.index, e);
        }

        // Markdown and empty units are processed without dispatch and
        // advance immediately.
        if unit.is_markdown() || source.is_empty() {
            self.callback.on_unit_skipped(resource, unit.index);
            return true;
        }

        self.callback.on_unit_started(resource, unit);

        // Baseline is captured per unit, immediately before dispatch, so
        // a late signal from a previously timed-out unit is absorbed here
        // instead of being attributed to this unit.
        let unit_baseline = self.poller.current_completed(resource);

        if let Err(e) = self.bridge.dispatch(resource, &source.text) {
            tracing::warn!("Dispatch failed for unit {}: {}", unit.index, e);
            self.callback.on_unit_skipped(resource, unit.index);
            return true;
        }

        match self.poller.wait_for_completion(resource, unit_baseline).await {
            Ok(WaitOutcome::Completed) => {
                run.completed += 1;
                self.callback.on_unit_completed(resource, unit.index);
            }
            Ok(WaitOutcome::TimedOut) => {
                // A slow unit must not block the rest of the run.
                run.timed_out += 1;
                tracing::info!(
                    "Unit {} of resource {} timed out; continuing",
                    unit.index,
                    resource
                );
                self.callback.on_unit_timeout(resource, unit.index);
            }
            Ok(WaitOutcome::BufferInvalid) => return false,
            Err(e) => {
                tracing::warn!("Completion wait failed for unit {}: {}", unit.index, e);
                self.callback.on_unit_timeout(resource, unit.index);
            }
        }

        // Let the kernel's output rendering catch up before the next
        // dispatch shifts the document again.
        tokio::time::sleep(self.settle_delay).await;
        true
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashSet<ResourceId>> {
        self.active.lock().unwrap_or_else(|e| e.into_inner())
    }
}

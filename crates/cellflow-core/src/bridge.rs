//! Collaborator seam toward the external kernel and document host.
//!
//! The orchestrator never talks to the interpreter process or the document
//! model directly. Everything it needs is expressed on [`KernelBridge`]:
//! dispatching source, reading the annotation channel, locating and
//! focusing units in the live document, triggering reloads, and throttling
//! the kernel's background tick loop. Hosts implement this once; tests use
//! an in-memory mock.

use crate::error::Result;
use crate::types::{ChannelInfo, CompletionSignal, ResourceId};

/// Kernel-assigned identity of an annotation channel.
pub type ChannelId = u64;

/// Source text of a unit as located in the live document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnitSource {
    /// The unit's source text, exactly as it appears between markers.
    pub text: String,
    /// Line range `(start, end)` in the current document.
    pub line_range: (u32, u32),
}

impl UnitSource {
    /// Whether there is nothing to dispatch between the markers.
    pub fn is_empty(&self) -> bool {
        self.text.trim().is_empty()
    }
}

/// Host-provided access to the kernel and the document model.
///
/// All methods are fire-and-forget or cheap queries; long-running work
/// stays on the host's side. Implementations must be callable from timer
/// callbacks.
pub trait KernelBridge: Send + Sync {
    /// Hand one unit's source text to the kernel. Fire-and-forget;
    /// completion surfaces later on the annotation channel.
    fn dispatch(&self, resource: ResourceId, source: &str) -> Result<()>;

    /// Whether the resource (buffer) still exists.
    fn resource_exists(&self, resource: ResourceId) -> bool;

    /// Annotation channels currently advertised for the resource.
    fn channels(&self, resource: ResourceId) -> Vec<ChannelInfo>;

    /// Completion signals currently present on the given channel.
    fn signals(&self, resource: ResourceId, channel: ChannelId) -> Result<Vec<CompletionSignal>>;

    /// Re-locate a unit in the live document by counting markers from the
    /// top. Returns `None` when the document no longer contains a unit at
    /// that position.
    fn locate_unit(&self, resource: ResourceId, index: u32) -> Result<Option<UnitSource>>;

    /// Move cursor/focus to the unit at the given position.
    fn focus_unit(&self, resource: ResourceId, index: u32) -> Result<()>;

    /// Trigger a document reload. Callers must hold a reload permit.
    fn reload_document(&self, resource: ResourceId) -> Result<()>;

    /// Current kernel background tick interval in milliseconds.
    fn tick_interval(&self) -> u64;

    /// Set the kernel background tick interval in milliseconds.
    fn set_tick_interval(&self, millis: u64);
}

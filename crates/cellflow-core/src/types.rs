//! Core data model for orchestrated runs.
//!
//! These types describe one "run all" request: the ordered units derived
//! from the document, the run bookkeeping, and the completion signals the
//! kernel writes into its annotation channel.

use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// Identifier for a document resource (one open buffer).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceId(u64);

impl ResourceId {
    /// Create a new resource id.
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the raw id value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ResourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What kind of content a unit holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnitKind {
    /// Dispatchable source code.
    Code,
    /// Prose; processed without dispatch.
    Markdown,
}

/// One dispatchable segment of the document, analogous to a notebook cell.
///
/// Units are derived fresh from the document when a run starts and are
/// immutable for the run's lifetime. Positions are *not* trusted after
/// dispatch begins; the executor re-locates each unit from the live
/// document because earlier units can change document length.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionUnit {
    /// 1-based position within the run, stable for the run's lifetime.
    pub index: u32,
    /// Code or markdown.
    pub kind: UnitKind,
    /// Line range `(start, end)` at the time the run was requested.
    pub line_range: (u32, u32),
}

impl ExecutionUnit {
    /// Create a code unit.
    pub fn code(index: u32, line_range: (u32, u32)) -> Self {
        Self {
            index,
            kind: UnitKind::Code,
            line_range,
        }
    }

    /// Create a markdown unit.
    pub fn markdown(index: u32, line_range: (u32, u32)) -> Self {
        Self {
            index,
            kind: UnitKind::Markdown,
            line_range,
        }
    }

    /// Whether this unit is skipped without dispatch.
    pub fn is_markdown(&self) -> bool {
        self.kind == UnitKind::Markdown
    }
}

/// Status carried by a completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalStatus {
    /// The unit is still executing.
    Running,
    /// The unit finished; its id counts toward run progress.
    Done,
    /// The marker could not be interpreted.
    Unknown,
}

/// Out-of-band completion marker written by the kernel.
///
/// Read-only from the orchestrator's perspective. Ids observed during a
/// run are non-decreasing; only an id strictly greater than the run's
/// baseline counts as new progress.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompletionSignal {
    /// Kernel-assigned unit id.
    pub unit_id: u64,
    /// Current status of the unit.
    pub status: SignalStatus,
    /// Rendered output text attached to the marker.
    pub rendered_text: String,
}

/// An annotation channel advertised by the kernel for a resource.
///
/// Several channels with similar names can coexist on one resource (output
/// markers vs. unrelated highlighting); lookups must match `name` exactly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelInfo {
    /// Kernel-assigned channel identity.
    pub id: u64,
    /// Channel name, matched exactly when resolving.
    pub name: String,
}

/// Bookkeeping for one in-flight "run all" request.
///
/// Owned exclusively by the executor task driving it; discarded on
/// completion, abort, or document invalidation.
#[derive(Debug, Clone)]
pub struct ExecutionRun {
    /// Number of units in the run.
    pub total_units: u32,
    /// 1-based index of the unit currently being driven.
    /// Invariant: `0 <= current_index <= total_units + 1`.
    pub current_index: u32,
    /// Highest completed id observed when the run began.
    pub baseline_completed_id: u64,
    /// When the run was requested.
    pub started_at: Instant,
    /// Units that completed within the ceiling.
    pub completed: u32,
    /// Units that hit the timeout ceiling but were advanced past.
    pub timed_out: u32,
}

impl ExecutionRun {
    /// Start bookkeeping for a run of `total_units` units.
    pub fn new(total_units: u32, baseline_completed_id: u64) -> Self {
        Self {
            total_units,
            current_index: 1,
            baseline_completed_id,
            started_at: Instant::now(),
            completed: 0,
            timed_out: 0,
        }
    }

    /// Advance past the current unit.
    pub fn advance(&mut self) {
        debug_assert!(self.current_index <= self.total_units);
        self.current_index += 1;
    }

    /// Whether every unit has been driven.
    pub fn is_complete(&self) -> bool {
        self.current_index > self.total_units
    }
}

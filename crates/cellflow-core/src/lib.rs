//! Execution orchestration for kernel-backed notebook documents.
//!
//! This crate provides:
//! - Sequential multi-unit dispatch with completion detection over an
//!   out-of-band annotation channel
//! - A reentrancy guard that stops the kernel's tick loop from cascading
//!   into the reload pipeline that invoked it
//! - A TTL cache and a durable state store (debounced, atomic writes)
//!   backing the orchestration and guard logic
//!
//! The kernel and document host sit behind the [`KernelBridge`] trait;
//! everything else is wired together by [`Orchestrator`].

pub mod bridge;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod guard;
pub mod poll;
pub mod run;
pub mod store;
pub mod types;

pub use bridge::{ChannelId, KernelBridge, UnitSource};
pub use cache::{CacheStats, TtlCache};
pub use config::{DEFAULT_OUTPUT_CHANNEL, OrchestratorConfig, TtlRule};
pub use context::Orchestrator;
pub use error::{Error, Result};
pub use guard::{ReloadGuard, ReloadPermit};
pub use poll::{CompletionPoller, WaitOutcome};
pub use run::{RunCallback, SequentialExecutor, SilentCallback};
pub use store::{DURABLE_PREFIX, StateStore, StoreStats};
pub use types::{
    ChannelInfo, CompletionSignal, ExecutionRun, ExecutionUnit, ResourceId, SignalStatus, UnitKind,
};

//! tagsync-core: role-to-policy tag synchronization engine.
//!
//! Each run discovers customer-managed policies, looks up the roles attached
//! to them, and converges every policy's tags onto the union of its roles'
//! tags. Synchronization is one-directional (role → policy) and
//! level-triggered: a run recomputes desired state from scratch, so a failed
//! or missed mutation heals on the next run.
//!
//! # Architecture
//!
//! ```text
//! RunCoordinator ──► Enumerator ──► (policy, roles)
//!        │                               │
//!        │                         resolve() ─► plan() ─► MutationExecutor
//!        │                                                     │
//!        └──────────────── RunSummary ◄────── outcomes ◄───────┘
//! ```
//!
//! # Modules
//!
//! - `model`: roles, policies, tag maps and mutation plans
//! - `reserved`: system-owned tag keys that are never synchronized
//! - `resolver`: pure computation of a policy's target tag set
//! - `planner`: diff between current and target tags
//! - `store`: the remote resource store capability interface
//! - `retry`: bounded exponential backoff policy
//! - `enumerator`: lazy paginated discovery
//! - `executor`: applies mutation plans
//! - `coordinator`: one reconciliation pass
//! - `summary`: the run summary record
//! - `lease`: single-run lease
//! - `config`: file/environment configuration

#![forbid(unsafe_code)]

pub mod config;
pub mod coordinator;
pub mod enumerator;
pub mod error;
pub mod executor;
pub mod lease;
pub mod model;
pub mod planner;
pub mod reserved;
pub mod resolver;
pub mod retry;
pub mod store;
pub mod summary;

pub use config::{Config, ConfigError};
pub use coordinator::{EngineOptions, RunCoordinator};
pub use enumerator::{Enumerator, PolicyBinding};
pub use error::{DiscoveryError, MutationError, MutationPhase, StoreError};
pub use executor::{Applied, AppliedVia, MutationExecutor};
pub use model::{IdentityRole, ManagedPolicy, PolicyScope, TagMap, TagMutationPlan};
pub use planner::{SyncMode, plan, plan_with_mode};
pub use reserved::{RESERVED_KEYS, ReservedKeySet};
pub use resolver::resolve;
pub use retry::{RetryDecision, RetryPolicy};
pub use store::{PolicyPage, ResourceStore};
pub use summary::{FailureKind, PairFailure, RunSummary};

/// Crate version, recorded in lease metadata.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

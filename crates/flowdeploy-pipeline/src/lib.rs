//! Analytics pipeline deployment worker.
//!
//! Turns process tasks into flow-engine pipeline requests: parameters are
//! read by [`ParamExtractor`], port selections resolved by
//! [`SelectionResolver`], nodes compiled by [`NodeCompiler`], and the
//! create-or-update decision made by [`Reconciler`]. The [`Worker`] drives
//! tasks end to end and rolls back through the [`Compensator`] on failure,
//! while the [`HealthMonitor`] periodically checks deployed pipelines.

pub mod compensator;
pub mod compiler;
pub mod config;
pub mod duration_serde;
pub mod events;
pub mod handler;
pub mod health;
pub mod params;
pub mod reconciler;
pub mod selection;
pub mod testing;
pub mod worker;

pub use compensator::{CompensationReport, Compensator};
pub use compiler::{group_inputs, sort_inputs, NodeCompiler};
pub use config::{ResolverSettings, WorkerConfig};
pub use events::{EventEmitter, WorkerEvent};
pub use handler::{merge_module_data, AnalyticsHandler, Attempt, TaskHandler};
pub use health::{HealthMonitor, SweepSummary, Verdict};
pub use params::ParamExtractor;
pub use reconciler::{next_revision, ReconcileAction, Reconciler, Reconciliation};
pub use selection::{requires_criteria, SelectionResolver, ServiceIndex};
pub use worker::{TaskOutcome, Worker};

//! MindVPN Metrics
//!
//! Read-only observability for the control core:
//!
//! - [`DispatchMetrics`]: counts and latency percentiles for agent calls,
//!   broken down per task action and per node
//! - [`FleetSnapshot`]: nodes, tasks and inbounds counted by status
//!
//! # Usage Example
//!
//! ```rust
//! use mindvpn_metrics::{DispatchMetrics, DispatchOutcome};
//!
//! let metrics = DispatchMetrics::new();
//! metrics.start().finish("APPLY_INBOUND", 42, DispatchOutcome::Timeout);
//!
//! let snapshot = metrics.snapshot();
//! assert_eq!(snapshot.actions["APPLY_INBOUND"].timeouts, 1);
//! assert_eq!(snapshot.nodes[&42].failed, 1);
//! ```
//!
//! # Thread Safety
//!
//! Counters are lock-free atomics. The per-action and per-node maps sit
//! behind a `RwLock` that is only held to look up or insert an entry.

mod collector;
mod registry;
mod snapshot;

pub use collector::{DispatchMetrics, InFlightCall};
pub use registry::{DispatchOutcome, MetricsRegistry};
pub use snapshot::{ActionMetrics, FleetSnapshot, MetricsSnapshot, NodeDispatchMetrics, StatusCounts};

//! MindVPN Common Types
//!
//! This crate provides the shared vocabulary of the MindVPN control core:
//! record identifiers, the closed status/action enumerations, the error
//! taxonomy, and the wire types exchanged with node agents.
//!
//! # Overview
//!
//! The control core manages a fleet of VPN relay nodes. Every other crate in
//! the workspace depends on this one:
//!
//! - **Model**: Identifiers ([`NodeId`], [`TaskId`], ...) and the enumerations
//!   that drive the node and task state machines
//! - **Protocol**: The [`FleetError`] taxonomy and the JSON-RPC envelopes
//!   used to talk to the agent process running on each node
//!
//! # Components
//!
//! - [`model`] - Identifiers and status enumerations
//! - [`protocol`] - Errors, JSON-RPC 2.0 envelopes, agent requests/responses
//!
//! # Example
//!
//! ```
//! use mindvpn_common::{NodeStatus, TaskAction, TaskStatus};
//!
//! let action: TaskAction = "APPLY_INBOUND".parse().unwrap();
//! assert!(action.mutates_config());
//! assert!(TaskStatus::Queued.can_transition_to(TaskStatus::Running));
//! assert!(!NodeStatus::New.can_transition_to(NodeStatus::Down));
//! ```

pub mod model;
pub mod protocol;

pub use model::*;
pub use protocol::*;

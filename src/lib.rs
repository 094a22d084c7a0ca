//! saler-flow - playbook flow engine for Saler
//!
//! Sales playbooks are directed graphs of trigger, condition, action, delay
//! and end nodes. This crate validates them, evaluates their conditions
//! against lead/user/workspace context, and runs them durably: every run is
//! checkpointed in SQLite after each node, so delays survive restarts.
//!
//! ## Example
//!
//! ```json
//! {
//!   "id": "hot-lead",
//!   "name": "Hot lead follow-up",
//!   "nodes": [
//!     { "id": "t", "type": "trigger", "data": { "label": "Lead created",
//!       "config": { "event": "lead.created" } } },
//!     { "id": "c", "type": "condition", "data": { "label": "Score check",
//!       "config": { "conditions": { "logic": "AND", "conditions": [
//!         { "field": "score", "operator": "greater_than", "value": 75 } ] } } } },
//!     { "id": "msg", "type": "action", "data": { "label": "WhatsApp",
//!       "config": { "action": "send_message", "template": "Hi {{ name }}" } } },
//!     { "id": "e", "type": "end", "data": { "label": "Done" } }
//!   ],
//!   "connections": [
//!     { "id": "c1", "source": "t", "target": "c" },
//!     { "id": "c2", "source": "c", "target": "msg", "condition": "true" },
//!     { "id": "c3", "source": "c", "target": "e", "condition": "false" },
//!     { "id": "c4", "source": "msg", "target": "e" }
//!   ]
//! }
//! ```

pub mod actions;
pub mod analytics;
pub mod conditions;
pub mod config;
pub mod engine;
pub mod error;
pub mod fields;
pub mod flow;
pub mod metrics;
pub mod shutdown;
pub mod storage;
pub mod tasks;
pub mod telemetry;

pub use error::{Error, Result};

//! concord-core - Core library for Concord
//!
//! Cross-document coordination for proposal workspaces: presence and section
//! locks over per-opportunity broadcast channels, coordination rules that
//! cascade field changes between documents, and two-way sync with cloud
//! editors.

pub mod adapters;
pub mod authz;
pub mod cascade;
pub mod channel;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod error;
pub mod lock;
pub mod models;
pub mod presence;
pub mod rules;
pub mod services;
pub mod sync;
pub mod util;

pub use coordinator::Coordinator;
pub use error::{Error, Result};
pub use models::{Actor, CoordinationRule, DocType, Role, RuleId};

//! Service layer: the SQLite-backed store and the collaborator traits it implements.

mod content;
mod store;

pub use content::{AuditSink, ContentStore};
pub use store::StoreService;

//! Persisted workflow state: the shared document and its lock-coordinated
//! store.

pub mod document;
pub mod store;

pub use document::{ActivityEntry, StateUpdate, WorkflowDocument, WorkflowStatus};
pub use store::PersistedStateStore;

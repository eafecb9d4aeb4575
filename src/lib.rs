pub mod agents;
pub mod config;
pub mod errors;
pub mod lock;
pub mod phase;
pub mod queue;
pub mod registry;
pub mod scheduler;
pub mod state;
pub mod workflow;

//! Persisted configuration and process state

pub mod layout;
pub mod lock;
pub mod settings;

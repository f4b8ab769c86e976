//! Long-running workers

pub mod scheduler;

//! Application wiring

pub mod cli;
pub mod oneshot;
pub mod options;
pub mod run;
pub mod state;

//! Check-and-apply engine

pub mod download;
pub mod fsm;
pub mod hooks;
pub mod state;
pub mod syncer;

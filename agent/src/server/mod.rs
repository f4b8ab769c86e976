//! Local control server

pub mod client;
pub mod handlers;
pub mod serve;
pub mod state;

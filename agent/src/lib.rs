//! pisync Library
//!
//! Core modules for the pisync file-synchronization agent.

pub mod app;
pub mod authn;
pub mod diagnostics;
pub mod errors;
pub mod filesys;
pub mod http;
pub mod installer;
pub mod logs;
pub mod models;
pub mod server;
pub mod storage;
pub mod sync;
pub mod utils;
pub mod workers;

//! Device setup

pub mod setup;

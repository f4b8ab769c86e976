//! Wire models

pub mod manifest;

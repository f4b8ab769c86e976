//! Device authentication

pub mod credential;
pub mod identity;

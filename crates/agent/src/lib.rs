//! Fleet liveness agent: configuration, startup and HTTP surface

pub mod api;
pub mod config;
pub mod startup;

//! Pre-fork style HTTP serving core.
//!
//! A [`server::Supervisor`] binds one listener, runs a fixed-size pool of
//! workers that accept from it and serve one request at a time through an
//! [`app::Application`], and kills and replaces any worker whose request
//! outlives the configured timeout.

pub mod app;
pub mod config;
pub mod error;
pub mod logger;
pub mod server;

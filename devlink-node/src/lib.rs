//! # devlink-node: device-control node service
//!
//! Runs one devlink peer: accepts and dials TCP links to the peers in
//! its config, answers `query` / `modify` against a simulated device,
//! broadcasts `sync` on local changes, and streams a synthetic camera
//! feed to viewers that request it.

pub mod config;
pub mod service;

//! Configuration module for the AV1 farm
//!
//! Handles loading coordinator and worker configuration from TOML files and
//! environment variable overrides, and computes the cluster config digest
//! that workers use to detect config drift.

pub mod config;

pub use config::*;

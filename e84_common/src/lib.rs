//! E84 Common Library
//!
//! Shared types for the E84 controller workspace crates.
//!
//! # Module Structure
//!
//! - [`signal`] - E84 signal naming, directions and polarity
//! - [`timer`] - Protocol timer identifiers (TP1–TP5) and durations
//! - [`config`] - TOML configuration loading and validation

pub mod config;
pub mod signal;
pub mod timer;

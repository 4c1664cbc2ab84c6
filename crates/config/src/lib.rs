//! Configuration module for vid2aud
//!
//! Handles loading settings from TOML files and environment variable overrides.

pub mod settings;

pub use settings::*;

//! Configuration module for the streaming TTS server.
//!
//! Provides CLI argument parsing and configuration management.

#[allow(clippy::module_inception)]
mod config;

pub use config::{Provider, ServerConfig};

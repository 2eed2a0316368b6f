//! mp4frag - MP4 fragmenter and fragment rewriter
//!
//! This library crate exposes configuration and the command implementations
//! for integration testing.

pub mod commands;
pub mod config;

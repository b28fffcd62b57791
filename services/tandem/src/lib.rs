//! Tandem Service Library Crate
//!
//! Everything the `tandem` binary runs: configuration, the world client and tool, prompt
//! loading, conversation persistence, session wiring and the console. The binary is a thin
//! wrapper around this library.

pub mod config;
pub mod console;
pub mod persistence;
pub mod prompts;
pub mod session;
pub mod tool;
pub mod world;

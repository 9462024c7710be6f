//! Corvid - an agent execution engine.
//!
//! Corvid drives a conversation between a language model and a set of tools.
//! Each turn passes through a middleware pipeline, calls the model, and fans
//! out the requested tool calls concurrently before looping back. Runs can be
//! bounded by a step budget, cancelled, interrupted for human input, and
//! asked to finish with a schema-validated structured response.

pub mod agent;
pub mod callback;
pub mod chat;
pub mod command;
pub mod error;
pub mod message;
pub mod middleware;
pub mod prelude;
pub mod state;
pub mod stream;
pub mod tool;

pub use error::{Error, Result, ToolError};

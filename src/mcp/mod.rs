//! MCP front end for the broker.
//!
//! - `types`: Serializable response types for MCP tools
//! - `schema`: JSON schema helpers for unsigned integer fields
//! - `commands`: MCP tool implementations and the read-only retry policy

pub mod commands;
pub mod schema;
pub mod types;

pub use commands::{McpBrokerCommands, RetryPolicy};

pub mod broker;
pub mod mcp;

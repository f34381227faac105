//! MCP (Model Context Protocol) surface.
//!
//! - `server.rs`   -- JSON-RPC protocol handler (stdin/stdout)
//! - `registry.rs` -- SQL-backed tool registry with hot reload
//! - `template.rs` -- `{{param}}` rendering and step execution
//! - `handlers/`   -- built-in, code-backed master tools (browser, brainloop)

pub mod handlers;
pub mod registry;
pub mod server;
pub mod template;

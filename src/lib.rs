// FILE: src/lib.rs
//! `stata_mcp_core`: the transport-independent execution substrate (§2
//! glossary "the hard core") plus the REST/SSE and MCP transport adapters
//! built on top of it. `main.rs` is a thin binary shell around this crate.

pub mod artefacts;
pub mod config;
pub mod controller;
pub mod engine;
pub mod error;
pub mod fanout;
pub mod filter;
pub mod model;
pub mod session_manager;
pub mod transport;
pub mod worker;

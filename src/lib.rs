//! cdbsh: an MCP server that lets AI agents drive the Windows crash-dump
//! debugger (cdb) for post-mortem analysis.
//!
//! The crate is organized around the debug engine: [`engine::DebugEngine`]
//! validates and dispatches, [`session`] owns session lifecycle,
//! [`process`] drives one cdb child with sentinel-framed I/O, [`queue`]
//! serializes and batches commands per session, [`recovery`] restarts hung
//! or dead debuggers, [`timeout`] is the process-wide deadline ticker, and
//! [`notify`] fans out JSON-RPC notifications. [`server`] exposes it all as
//! MCP tools.

pub mod batch;
pub mod command;
pub mod config;
pub mod engine;
pub mod error;
pub mod locator;
pub mod notify;
pub mod output;
pub mod process;
pub mod queue;
pub mod recovery;
pub mod server;
pub mod session;
pub mod sys;
pub mod timeout;

pub use engine::DebugEngine;
pub use error::{EngineError, EngineResult};

//! Purpose: Library crate behind `libmdnotes` (C ABI) and the `mdnotes` CLI.
//! Exports: `NotesRuntime`, `RuntimeConfig`, book builders, errors, and the C ABI.
//! Role: Serves markdown notes collections as live-reloading HTML on a loopback server.
//! Invariants: The runtime API is synchronous; async work stays on the server thread.
//! Invariants: Notes ids are one byte and never `0`.
pub mod abi;
pub mod config;
pub mod core;
mod login_env;
pub mod runtime;
mod server;
mod static_files;

pub use crate::config::RuntimeConfig;
pub use crate::core::builder::{BookBuilder, BookLayout, MdBookBuilder};
pub use crate::core::error::{Error, ErrorKind, to_exit_code};
pub use crate::core::notes::{NotesId, NotesSummary};
pub use crate::runtime::NotesRuntime;

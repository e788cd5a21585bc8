//! Hotgate - A development proxy that rebuilds your backend on the next request
//!
//! This library provides a reverse proxy for local development that:
//! - Builds the backend from source and supervises the running process
//! - Watches the source tree and invalidates the build when files change
//! - Rebuilds and restarts on the next request, sharing one build between callers
//! - Renders build errors, panics with source snippets and crashes as pages
//! - Optionally rebuilds in the background onto a spare port and cuts over

pub mod config;
pub mod context;
pub mod diagnostic;
pub mod error;
pub mod flight;
pub mod page;
pub mod pool;
pub mod process;
pub mod proxy;
pub mod supervisor;
pub mod toolchain;
pub mod watcher;

//! # Hotforge
//!
//! Hot-swap compilation pipeline for script plugins in a long-running host.
//!
//! Plugin sources are compiled by an external worker process, verified and
//! sandboxed at the module level, and swapped into the host without a
//! restart. A failed replacement never takes down a running plugin; the
//! previous version stays live.
//!
//! ## Pipeline
//!
//! - **Source cache**: reads plugin sources, tracks mtimes and encodings
//! - **Resolver**: parses header directives, expands `Requires` chains into
//!   one compilation batch, rejects cycles
//! - **Compiler session**: owns the worker process and its framed JSON
//!   protocol, restarts it on failure, shuts it down when idle
//! - **Verifier**: walks the compiled module IR and patches out denied API
//!   usage, publishing a constructor table for the loader
//! - **Load manager**: drives each unit through the load state machine and
//!   the unload/instantiate/register swap against the host

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
// Allow common patterns that are intentional in this codebase
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::option_if_let_else)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::map_unwrap_or)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::cognitive_complexity)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::future_not_send)]
#![allow(clippy::struct_excessive_bools)]

pub mod compiler;
pub mod config;
pub mod error;
pub mod load;
pub mod registry;
pub mod resolve;
pub mod source;
pub mod unit;
pub mod verify;
pub mod watch;

pub use config::{CompilerConfig, ForgeConfig, PathsConfig, SecurityConfig, WatchConfig};
pub use error::{ForgeError, ForgeResult};
pub use load::{LoadManager, PluginHandle, PluginHost};
pub use registry::{UnitHandle, UnitRegistry, UnitStatus};
pub use unit::{CompiledBinary, LoadState, PluginUnit, SourceEncoding};
pub use verify::{FactorySpec, ModuleIr, Verifier};
pub use watch::{SourceEvent, SourceWatcher};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Application name
pub const APP_NAME: &str = "hotforge";

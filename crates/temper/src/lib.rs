//! # Temper
//!
//! A plugin lifecycle and hot-reload engine.
//!
//! ## Overview
//!
//! Temper composes independently written plugins into one process, scopes
//! each of them to a slice of traffic, and swaps them in place when the code
//! behind them changes.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────┐  file changes  ┌──────────┐  classify  ┌─────────────┐
//! │ FileWatcher  │───────────────▶│ Reloader │───────────▶│ ModuleGraph │
//! └──────────────┘                └────┬─────┘            └─────────────┘
//!                                      │ dispose + re-apply
//!                                      ▼
//! ┌──────────────┐  plugin()  ┌──────────┐  spawn  ┌──────────────────────────┐
//! │ PluginLoader │───────────▶│ Registry │────────▶│ Runtime ─▶ Fork ─▶ apply │
//! └──────────────┘            └──────────┘         └──────────────────────────┘
//! ```
//!
//! - **Context**: an immutable view made of a session filter and service mapping
//! - **Runtime**: one record per plugin identity
//! - **Fork**: one instantiation of a plugin in a context; owns what `apply` registered
//! - **Reloader**: turns file changes into an all-or-nothing swap of runtimes
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use temper::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let modules = StaticLoader::new();
//!     modules.define("plugins/echo", |_scope| {
//!         Ok(Exports::Plugin(Plugin::function("echo", |ctx, _config| async move {
//!             ctx.guild(&["g1"]).command("echo", "Repeat a message");
//!             Ok(())
//!         })))
//!     });
//!
//!     let runtime = TemperRuntime::builder().loader(modules).build()?;
//!     let exit = runtime.run().await?;
//!     std::process::exit(exit.code());
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config`: read `temper.toml` (default)
//! - `yaml-config`: read `temper.yaml`
//! - `json-log`: JSON log output

pub use temper_core as core;
pub use temper_runtime as runtime;

/// Prelude module for convenient imports.
///
/// ```rust,ignore
/// use temper::prelude::*;
/// ```
pub mod prelude {
    // Runtime - main entry point
    pub use temper_runtime::{Exit, TemperRuntime};

    // Plugins and contexts
    pub use temper_core::{
        BoxError, Context, DISPOSE, Fork, INTERNAL_SERVICE, Payload, Plugin, PluginObject, READY,
        Registry, Session,
    };

    // Module system
    pub use temper_runtime::{Exports, LoadScope, ModuleLoader, StaticLoader};

    // Logging
    pub use temper_runtime::prelude::*;
}

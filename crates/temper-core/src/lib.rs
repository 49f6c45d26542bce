//! Temper Core - context algebra and plugin lifecycle engine.
//!
//! This crate provides:
//! - Immutable, composable [`Context`] views with session filters
//! - Plugin identity, runtimes and forks ([`Plugin`], [`Registry`], [`Fork`])
//! - Deterministic, reverse-order disposal of everything a fork registered
//! - Scoped service providers ([`Context::provide`], [`Context::isolate`])
//!
//! It has no notion of files or modules; hot reload lives in `temper-runtime`.
//!
//! # Example
//!
//! ```rust,ignore
//! use temper_core::{Plugin, Registry};
//!
//! let registry = Registry::new();
//! let echo = Plugin::function("echo", |ctx, _config| async move {
//!     ctx.guild(&["g1"]).on("message", |payload| println!("{payload:?}"));
//!     Ok(())
//! });
//!
//! let fork = registry.root().plugin(echo, serde_json::json!({})).await?;
//! registry.start();
//! fork.dispose().await;
//! ```

pub mod context;
pub mod disposable;
pub mod error;
pub mod events;
pub mod filter;
pub mod fork;
pub mod plugin;
pub mod registry;
pub mod service;
pub mod session;

pub use context::Context;
pub use disposable::Disposer;
pub use error::{BoxError, EngineError, EngineResult};
pub use events::{DISPOSE, INTERNAL_SERVICE, ListenerFn, Payload, READY};
pub use filter::Filter;
pub use fork::{Fork, ForkState};
pub use plugin::{ApplyFn, Plugin, PluginKey, PluginObject};
pub use registry::{ForkId, ForkRecord, Registry, RegistrySnapshot, RuntimeId, RuntimeInfo};
pub use service::{ProviderKey, ServiceArc, ServiceMapping};
pub use session::Session;

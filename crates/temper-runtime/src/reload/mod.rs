//! Hot reload: watching, classification and the swap itself.

pub mod classify;
pub mod orchestrator;
pub mod policy;
pub mod watcher;

pub use classify::{Classification, classify};
pub use orchestrator::{ReloadOutcome, Reloader};
pub use policy::ReloadPolicy;
pub use watcher::{ChangeStream, FileWatcher, IgnoreSet};

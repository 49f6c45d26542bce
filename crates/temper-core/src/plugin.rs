//! The plugin contract.
//!
//! A plugin is either a bare apply function or an object implementing
//! [`PluginObject`]. Both are normalized into the [`Plugin`] enum when they
//! are registered, so the registry only ever deals with one shape.
//!
//! Identity is reference identity: two clones of the same `Plugin` map to the
//! same runtime, while two separately constructed plugins never do, even when
//! they wrap identical code. This is what lets a hot-swapped module produce a
//! fresh runtime.
//!
//! # Example
//!
//! ```rust,ignore
//! use temper_core::{Context, Plugin};
//!
//! let greeter = Plugin::function("greeter", |ctx: Context, _config| async move {
//!     ctx.command("greet", "Say hello");
//!     Ok(())
//! });
//! root.plugin(greeter, serde_json::json!({})).await?;
//! ```

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;
use serde_json::Value;

use crate::context::Context;
use crate::error::BoxError;

/// Type-erased apply entry point.
pub type ApplyFn =
    Arc<dyn Fn(Context, Value) -> BoxFuture<'static, Result<(), BoxError>> + Send + Sync>;

/// Object-style plugin with metadata.
#[async_trait]
pub trait PluginObject: Send + Sync + 'static {
    /// Name used in logs and diagnostics.
    fn name(&self) -> &str;

    /// Services the plugin expects to find. Missing ones only produce a warning.
    fn using(&self) -> &[&'static str] {
        &[]
    }

    /// Reusable plugins may be forked several times into the same context,
    /// each fork with its own config.
    fn reusable(&self) -> bool {
        false
    }

    async fn apply(&self, ctx: Context, config: Value) -> Result<(), BoxError>;
}

/// Reference identity of a plugin value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PluginKey(usize);

/// A registrable plugin.
#[derive(Clone)]
pub enum Plugin {
    Function { name: Arc<str>, apply: ApplyFn },
    Object(Arc<dyn PluginObject>),
}

impl Plugin {
    /// Wraps an async function as a non-reusable plugin.
    pub fn function<F, Fut>(name: &str, apply: F) -> Self
    where
        F: Fn(Context, Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let apply: ApplyFn = Arc::new(
            move |ctx: Context, config: Value| -> BoxFuture<'static, Result<(), BoxError>> {
                Box::pin(apply(ctx, config))
            },
        );
        Plugin::Function {
            name: Arc::from(name),
            apply,
        }
    }

    pub fn object<P: PluginObject>(plugin: P) -> Self {
        Plugin::Object(Arc::new(plugin))
    }

    pub fn name(&self) -> &str {
        match self {
            Plugin::Function { name, .. } => name,
            Plugin::Object(object) => object.name(),
        }
    }

    pub fn using(&self) -> Vec<String> {
        match self {
            Plugin::Function { .. } => Vec::new(),
            Plugin::Object(object) => object.using().iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn is_reusable(&self) -> bool {
        match self {
            Plugin::Function { .. } => false,
            Plugin::Object(object) => object.reusable(),
        }
    }

    pub fn key(&self) -> PluginKey {
        let ptr = match self {
            Plugin::Function { apply, .. } => Arc::as_ptr(apply) as *const () as usize,
            Plugin::Object(object) => Arc::as_ptr(object) as *const () as usize,
        };
        PluginKey(ptr)
    }

    /// Whether both values are the same plugin identity.
    pub fn same(&self, other: &Plugin) -> bool {
        self.key() == other.key()
    }

    pub(crate) fn apply(
        &self,
        ctx: Context,
        config: Value,
    ) -> BoxFuture<'static, Result<(), BoxError>> {
        match self {
            Plugin::Function { apply, .. } => apply(ctx, config),
            Plugin::Object(object) => {
                let object = Arc::clone(object);
                Box::pin(async move { object.apply(ctx, config).await })
            }
        }
    }
}

impl<P: PluginObject> From<Arc<P>> for Plugin {
    fn from(plugin: Arc<P>) -> Self {
        Plugin::Object(plugin)
    }
}

impl fmt::Debug for Plugin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Plugin")
            .field("name", &self.name())
            .field("reusable", &self.is_reusable())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Counter;

    #[async_trait]
    impl PluginObject for Counter {
        fn name(&self) -> &str {
            "counter"
        }

        fn using(&self) -> &[&'static str] {
            &["database"]
        }

        fn reusable(&self) -> bool {
            true
        }

        async fn apply(&self, _ctx: Context, _config: Value) -> Result<(), BoxError> {
            Ok(())
        }
    }

    #[test]
    fn test_identity_is_reference_identity() {
        let a = Plugin::function("echo", |_ctx, _config| async { Ok(()) });
        let b = Plugin::function("echo", |_ctx, _config| async { Ok(()) });

        assert!(a.same(&a.clone()));
        assert!(!a.same(&b));
    }

    #[test]
    fn test_object_metadata() {
        let plugin = Plugin::object(Counter);
        assert_eq!(plugin.name(), "counter");
        assert!(plugin.is_reusable());
        assert_eq!(plugin.using(), vec!["database".to_string()]);

        let function = Plugin::function("f", |_ctx, _config| async { Ok(()) });
        assert!(!function.is_reusable());
        assert!(function.using().is_empty());
    }
}

//! Event surface and lifecycle notifications.
//!
//! Listeners are registered through [`Context::on`](crate::Context::on) and
//! are owned by the fork of the registering context. Delivery is
//! synchronous; the registry lock is released before any listener runs.

use std::sync::Arc;

use serde_json::Value;

use crate::context::Context;
use crate::registry::Shared;
use crate::session::Session;

/// Emitted once by [`Registry::start`](crate::Registry::start). Late listeners fire immediately.
pub const READY: &str = "ready";
/// Emitted to a fork's own listeners right before its disposables run.
pub const DISPOSE: &str = "dispose";
/// Emitted when the provider a context resolves for a service changes.
pub const INTERNAL_SERVICE: &str = "internal/service";

/// Event payload handed to listeners.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Empty,
    /// A session event. Only listeners whose context filter matches receive it.
    Session(Session),
    /// Name of the service whose provider changed.
    Service(String),
    Value(Value),
}

pub type ListenerFn = Arc<dyn Fn(&Payload) + Send + Sync>;

pub(crate) struct Listener {
    pub(crate) id: u64,
    pub(crate) name: String,
    pub(crate) context: Context,
    pub(crate) callback: ListenerFn,
}

/// Invokes every listener of `name` whose context satisfies `scope`.
///
/// Returns the number of listeners called.
pub(crate) fn emit_where<F>(shared: &Shared, name: &str, payload: &Payload, scope: F) -> usize
where
    F: Fn(&Context) -> bool,
{
    let candidates: Vec<(Context, ListenerFn)> = {
        let state = shared.state.lock();
        state
            .listeners
            .iter()
            .filter(|listener| listener.name == name)
            .map(|listener| (listener.context.clone(), listener.callback.clone()))
            .collect()
    };

    let mut delivered = 0;
    for (context, callback) in candidates {
        if scope(&context) {
            callback(payload);
            delivered += 1;
        }
    }
    delivered
}

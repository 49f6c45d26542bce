//! Cleanup records owned by forks.

use std::fmt;
use std::sync::Arc;

use futures::future::BoxFuture;
use tokio::task::AbortHandle;
use tracing::warn;

use crate::error::BoxError;
use crate::fork::dispose_fork;
use crate::registry::{self, ForkId, Shared};
use crate::service::ProviderKey;

pub(crate) type CleanupFn = Box<dyn FnOnce() -> BoxFuture<'static, Result<(), BoxError>> + Send>;

/// One entry of a fork's disposable list.
pub(crate) enum Cleanup {
    /// A nested fork created from the owning fork's context.
    Fork(ForkId),
    Listener(u64),
    Command(u64),
    Service {
        name: String,
        key: ProviderKey,
        /// Address of the stored instance; a replaced provider is left alone.
        identity: usize,
    },
    Task(AbortHandle),
    Callback(CleanupFn),
}

impl Cleanup {
    pub(crate) fn is_fork(&self) -> bool {
        matches!(self, Cleanup::Fork(_))
    }

    pub(crate) async fn run(self, shared: &Arc<Shared>) -> Result<(), BoxError> {
        match self {
            Cleanup::Fork(id) => {
                dispose_fork(Arc::clone(shared), id).await;
            }
            Cleanup::Listener(id) => {
                shared.state.lock().listeners.retain(|l| l.id != id);
            }
            Cleanup::Command(id) => {
                shared.state.lock().commands.retain(|c| c.id != id);
            }
            Cleanup::Service {
                name,
                key,
                identity,
            } => {
                let removed = {
                    let mut state = shared.state.lock();
                    let slot = (name.clone(), key);
                    let current = state
                        .services
                        .get(&slot)
                        .map(|service| Arc::as_ptr(service) as *const () as usize);
                    current == Some(identity) && state.services.remove(&slot).is_some()
                };
                if removed {
                    registry::notify_service(shared, &name, key);
                }
            }
            Cleanup::Task(handle) => handle.abort(),
            Cleanup::Callback(callback) => return callback().await,
        }
        Ok(())
    }

    /// Runs a cleanup that has no live owner on the ambient tokio runtime.
    pub(crate) fn release(self, shared: Arc<Shared>) {
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(error) = self.run(&shared).await {
                        warn!(error = %error, "Late cleanup failed");
                    }
                });
            }
            Err(_) => warn!("No async runtime available, late registration leaked"),
        }
    }
}

/// Handle returned by every registration surface.
///
/// Disposing it removes the entry from its owning fork and runs it once.
/// Later calls, and calls after the fork itself was disposed, do nothing.
#[derive(Clone)]
pub struct Disposer {
    shared: Arc<Shared>,
    owner: Option<ForkId>,
    id: u64,
}

impl Disposer {
    pub(crate) fn new(shared: Arc<Shared>, owner: Option<ForkId>, id: u64) -> Self {
        Self { shared, owner, id }
    }

    /// Returns `true` if this call ran the cleanup.
    pub async fn dispose(&self) -> bool {
        let cleanup = {
            let mut guard = self.shared.state.lock();
            let state = &mut *guard;
            let list = match self.owner {
                Some(fork) => state.forks.get_mut(&fork).map(|entry| &mut entry.disposables),
                None => Some(&mut state.detached),
            };
            list.and_then(|list| {
                let index = list.iter().position(|(id, _)| *id == self.id)?;
                Some(list.remove(index).1)
            })
        };

        let Some(cleanup) = cleanup else {
            return false;
        };
        if let Err(error) = cleanup.run(&self.shared).await {
            warn!(error = %error, "Disposable failed");
        }
        true
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("owner", &self.owner)
            .field("id", &self.id)
            .finish()
    }
}

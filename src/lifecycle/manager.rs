//! Registry of live resources for coordinated teardown.
//!
//! # Responsibilities
//! - Track every live channel, listener and connector
//! - Shut all of them down exactly once on process teardown
//! - Refuse new registrations once teardown has begun
//!
//! # Design Decisions
//! - Entries are `Weak`: the creator owns the resource, the registry only
//!   reaches it for shutdown
//! - One short critical section per mutation; `Resource::shutdown` is always
//!   called with the lock released so it may re-enter `unregister`
//! - Closing and snapshotting happen under the same lock, so a racing
//!   `register` either lands in the sweep or is rejected

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use super::Resource;

/// Error returned by [`ResourceManager::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum RegisterError {
    /// `shutdown_all` has already begun. The caller must shut its resource
    /// down itself.
    #[error("resource manager is shutting down")]
    Closed,
}

#[derive(Default)]
struct Registry {
    closed: bool,
    next_id: u64,
    resources: HashMap<u64, Weak<dyn Resource>>,
}

/// Lifecycle coordinator shared by every listener, connector and channel of
/// one network stack.
///
/// Cloning is cheap; all clones refer to the same registry.
#[derive(Clone, Default)]
pub struct ResourceManager {
    inner: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for ResourceManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.lock();
        f.debug_struct("ResourceManager")
            .field("closed", &registry.closed)
            .field("registered", &registry.resources.len())
            .finish()
    }
}

impl ResourceManager {
    /// Create an empty, open manager.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Registry> {
        // A panic inside the critical section cannot leave the map half
        // mutated, so a poisoned lock is still usable.
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start tracking `resource`.
    ///
    /// The returned handle removes the entry when dropped.
    pub fn register<R>(&self, resource: &Arc<R>) -> Result<RegistrationHandle, RegisterError>
    where
        R: Resource + 'static,
    {
        let weak: Weak<dyn Resource> = Arc::downgrade(resource) as Weak<dyn Resource>;
        let mut registry = self.lock();
        if registry.closed {
            return Err(RegisterError::Closed);
        }
        let id = registry.next_id;
        registry.next_id += 1;
        registry.resources.insert(id, weak);
        tracing::trace!(registration = id, "Resource registered");

        Ok(RegistrationHandle {
            id,
            registry: Arc::downgrade(&self.inner),
        })
    }

    /// Stop tracking the resource behind `handle`. Equivalent to dropping it.
    pub fn unregister(&self, handle: RegistrationHandle) {
        drop(handle);
    }

    /// Shut down every registered resource and close the manager.
    ///
    /// Subsequent `register` calls fail with [`RegisterError::Closed`]. A
    /// second call finds an empty registry and does nothing.
    pub fn shutdown_all(&self) {
        let snapshot: Vec<Weak<dyn Resource>> = {
            let mut registry = self.lock();
            registry.closed = true;
            registry.resources.drain().map(|(_, weak)| weak).collect()
        };

        tracing::debug!(count = snapshot.len(), "Shutting down registered resources");

        for resource in snapshot.iter().filter_map(Weak::upgrade) {
            resource.shutdown();
        }
    }

    /// Whether `shutdown_all` has been called.
    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of currently registered resources.
    pub fn len(&self) -> usize {
        self.lock().resources.len()
    }

    /// True when nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Proof of registration. Removes the entry from the registry when dropped.
///
/// Holds only a weak reference to the registry, so an outstanding handle
/// never keeps a torn-down manager alive.
#[derive(Debug)]
pub struct RegistrationHandle {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl RegistrationHandle {
    /// Raw registration id, unique per manager.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for RegistrationHandle {
    fn drop(&mut self) {
        if let Some(registry) = self.registry.upgrade() {
            let mut registry = registry.lock().unwrap_or_else(PoisonError::into_inner);
            // Already drained if shutdown_all ran first.
            registry.resources.remove(&self.id);
        }
    }
}

//! The `Resource` capability.

/// Something that can be asked to release its resources.
///
/// `shutdown` must be idempotent and callable from any thread: the owner of a
/// resource and the [`ResourceManager`](super::ResourceManager) sweep may both
/// invoke it, possibly at the same time. Only the first call has an effect.
pub trait Resource: Send + Sync {
    /// Request release. Returns without waiting for in-flight work to drain.
    fn shutdown(&self);
}

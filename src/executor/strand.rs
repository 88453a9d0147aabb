//! Per-channel execution serializer.
//!
//! A `Strand` runs posted units one at a time, in posting order, on the shared
//! Tokio worker pool. The guarantee is mutual exclusion and ordering, not
//! thread affinity: consecutive units may run on different workers.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::runtime::Handle;
use tokio::sync::{mpsc, oneshot};

static STRAND_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

type Unit = Box<dyn FnOnce() + Send + 'static>;

/// Returned when the strand's drain task is gone (runtime shut down).
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("strand executor is no longer running")]
pub struct StrandClosed;

/// Handle to a serialized execution context.
///
/// Clones post to the same queue. The drain task exits once every clone is
/// dropped and the queue is empty, so a unit capturing an `Arc` keeps that
/// value alive until the unit has run.
#[derive(Clone)]
pub struct Strand {
    id: u64,
    tx: mpsc::UnboundedSender<Unit>,
    handle: Handle,
}

impl std::fmt::Debug for Strand {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Strand").field("id", &self.id).finish()
    }
}

impl Strand {
    /// Create a strand whose units run on `handle`'s worker pool.
    pub fn new(handle: Handle) -> Self {
        let id = STRAND_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        handle.spawn(drain(id, rx));
        Self { id, tx, handle }
    }

    /// Create a strand on the runtime of the calling task.
    ///
    /// # Panics
    /// Panics when called outside a Tokio runtime.
    pub fn current() -> Self {
        Self::new(Handle::current())
    }

    /// Create a new, independent strand on the same runtime.
    pub fn fork(&self) -> Self {
        Self::new(self.handle.clone())
    }

    /// Identifier for diagnostics.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Runtime the strand executes on.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Queue `unit` behind every unit posted before it.
    ///
    /// Safe to call from inside a running unit; the new unit runs after the
    /// current one returns.
    pub fn post<F>(&self, unit: F) -> Result<(), StrandClosed>
    where
        F: FnOnce() + Send + 'static,
    {
        self.tx.send(Box::new(unit)).map_err(|_| StrandClosed)
    }

    /// Run `f` on the strand and wait for its result.
    pub async fn run<F, R>(&self, f: F) -> Result<R, StrandClosed>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        self.post(move || {
            let _ = tx.send(f());
        })?;
        rx.await.map_err(|_| StrandClosed)
    }
}

async fn drain(id: u64, mut rx: mpsc::UnboundedReceiver<Unit>) {
    while let Some(unit) = rx.recv().await {
        // A panicking unit must not take the other units of this strand down.
        if catch_unwind(AssertUnwindSafe(unit)).is_err() {
            tracing::error!(strand = id, "Strand unit panicked");
        }
    }
    tracing::trace!(strand = id, "Strand drained");
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn units_run_in_posting_order() {
        let strand = Strand::current();
        let seen = Arc::new(Mutex::new(Vec::new()));

        for i in 0..1000 {
            let seen = seen.clone();
            strand.post(move || seen.lock().unwrap().push(i)).unwrap();
        }
        strand.run(|| ()).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(*seen, (0..1000).collect::<Vec<_>>());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn units_never_overlap() {
        let strand = Strand::current();
        let busy = Arc::new(AtomicBool::new(false));
        let overlaps = Arc::new(AtomicU64::new(0));

        let mut posters = Vec::new();
        for _ in 0..8 {
            let strand = strand.clone();
            let busy = busy.clone();
            let overlaps = overlaps.clone();
            posters.push(tokio::spawn(async move {
                for _ in 0..100 {
                    let busy = busy.clone();
                    let overlaps = overlaps.clone();
                    strand
                        .post(move || {
                            if busy.swap(true, Ordering::SeqCst) {
                                overlaps.fetch_add(1, Ordering::SeqCst);
                            }
                            std::hint::spin_loop();
                            busy.store(false, Ordering::SeqCst);
                        })
                        .unwrap();
                }
            }));
        }
        for poster in posters {
            poster.await.unwrap();
        }
        strand.run(|| ()).await.unwrap();

        assert_eq!(overlaps.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn reentrant_post_runs_after_current_unit() {
        let strand = Strand::current();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let inner = strand.clone();
        let outer_seen = seen.clone();
        strand
            .post(move || {
                let nested_seen = outer_seen.clone();
                inner.post(move || nested_seen.lock().unwrap().push("nested")).unwrap();
                outer_seen.lock().unwrap().push("outer");
            })
            .unwrap();
        let tail_seen = seen.clone();
        strand.post(move || tail_seen.lock().unwrap().push("tail")).unwrap();

        // The nested unit was queued behind "tail".
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if seen.lock().unwrap().len() == 3 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec!["outer", "tail", "nested"]);
    }

    #[tokio::test]
    async fn panicking_unit_does_not_stop_the_strand() {
        let strand = Strand::current();
        strand.post(|| panic!("unit failure")).unwrap();

        assert_eq!(strand.run(|| 7).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn forked_strands_are_independent() {
        let strand = Strand::current();
        let fork = strand.fork();
        assert_ne!(strand.id(), fork.id());
        assert_eq!(fork.run(|| "ok").await.unwrap(), "ok");
    }
}

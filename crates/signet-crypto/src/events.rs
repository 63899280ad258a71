//! Store notifications.
//!
//! Listeners are called synchronously, in registration order, while the
//! triggering mutation is in progress. A listener that errors or panics is
//! logged and skipped; the mutation carries on.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};

use tracing::error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreEvent {
    /// A peer's stored identity key was replaced. Security relevant:
    /// surface it to the user.
    KeyChanged { peer_id: String },
    /// A one-time prekey was consumed or evicted; replenishment may be due.
    PreKeyRemoved { id: u32 },
}

pub trait StoreListener: Send + Sync {
    fn on_event(&self, event: &StoreEvent) -> anyhow::Result<()>;
}

impl<F> StoreListener for F
where
    F: Fn(&StoreEvent) -> anyhow::Result<()> + Send + Sync,
{
    fn on_event(&self, event: &StoreEvent) -> anyhow::Result<()> {
        self(event)
    }
}

#[derive(Default)]
pub(crate) struct Listeners {
    inner: RwLock<Vec<Arc<dyn StoreListener>>>,
}

impl Listeners {
    pub(crate) fn add(&self, listener: Arc<dyn StoreListener>) {
        self.inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(listener);
    }

    pub(crate) fn emit(&self, event: &StoreEvent) {
        let listeners = self
            .inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for listener in listeners {
            match catch_unwind(AssertUnwindSafe(|| listener.on_event(event))) {
                Ok(Ok(())) => {}
                Ok(Err(e)) => error!(?event, "store listener failed: {e:#}"),
                Err(_) => error!(?event, "store listener panicked"),
            }
        }
    }
}

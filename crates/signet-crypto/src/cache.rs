//! Hydration-gated caches.
//!
//! A [`Cache`] is empty until the store hydrates it; every access before
//! that is `NotInitialized`. Entries start [`CacheEntry::Cold`] (the
//! persisted row only) and are promoted once to [`CacheEntry::Hydrated`].

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::StoreError;

pub(crate) struct Cache<T> {
    name: &'static str,
    inner: Mutex<Option<T>>,
}

impl<T> Cache<T> {
    pub(crate) fn new(name: &'static str) -> Self {
        Self {
            name,
            inner: Mutex::new(None),
        }
    }

    fn guard(&self) -> MutexGuard<'_, Option<T>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn fill(&self, value: T) {
        *self.guard() = Some(value);
    }

    /// Run `f` against the hydrated value. The lock is held for the
    /// duration of `f`, so `f` must not block.
    pub(crate) fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, StoreError> {
        let mut guard = self.guard();
        match guard.as_mut() {
            Some(value) => Ok(f(value)),
            None => Err(StoreError::NotInitialized(self.name)),
        }
    }
}

/// A cached record: persisted form only, or persisted form plus the
/// constructed object.
#[derive(Debug)]
pub enum CacheEntry<R, T> {
    Cold { raw: R },
    Hydrated { raw: R, item: Arc<T> },
}

impl<R: Clone, T> CacheEntry<R, T> {
    pub fn cold(raw: R) -> Self {
        Self::Cold { raw }
    }

    pub fn hydrated(raw: R, item: T) -> Self {
        Self::Hydrated {
            raw,
            item: Arc::new(item),
        }
    }

    pub fn raw(&self) -> &R {
        match self {
            Self::Cold { raw } | Self::Hydrated { raw, .. } => raw,
        }
    }

    pub fn is_hydrated(&self) -> bool {
        matches!(self, Self::Hydrated { .. })
    }

    /// Promote in place and return the constructed object. Calling this on
    /// a hydrated entry returns the existing `Arc`; `build` is not run.
    /// A failed build leaves the entry cold.
    pub fn hydrate<E>(&mut self, build: impl FnOnce(&R) -> Result<T, E>) -> Result<Arc<T>, E> {
        match self {
            Self::Hydrated { item, .. } => Ok(Arc::clone(item)),
            Self::Cold { raw } => {
                let item = Arc::new(build(raw)?);
                let raw = raw.clone();
                *self = Self::Hydrated {
                    raw,
                    item: Arc::clone(&item),
                };
                Ok(item)
            }
        }
    }
}

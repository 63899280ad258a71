//! Per-address serialized task queues.
//!
//! Every mutation of a peer-device's ratchet state runs through that
//! address's queue: FIFO, one job at a time, each job bounded by a timeout.
//! Queues are created on first use and live as long as the store.
//!
//! A job never waits on another queue while it holds its own. Work it needs
//! done under another key is deferred and handed back to the caller once
//! the job's turn has been released.

use std::future::Future;
use std::sync::{Arc, Mutex as StdMutex, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::StoreError;

tokio::task_local! {
    /// The job running on this task.
    static ACTIVE_JOB: ActiveJob;
}

struct ActiveJob {
    key: String,
    deferred: Arc<StdMutex<Vec<(String, Deferred)>>>,
}

/// Session work a job asked for under another address.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Deferred {
    Archive,
    Remove,
}

#[derive(Default)]
struct TaskQueue {
    /// tokio's mutex hands out the lock in request order.
    turn: Mutex<()>,
}

/// What a queued job produced, plus the work it deferred to other keys.
pub(crate) struct Completed<T> {
    pub(crate) result: Result<T, StoreError>,
    pub(crate) deferred: Vec<(String, Deferred)>,
}

pub(crate) struct SessionQueues {
    queues: DashMap<String, Arc<TaskQueue>>,
    timeout: Duration,
}

impl SessionQueues {
    pub(crate) fn new(timeout: Duration) -> Self {
        Self {
            queues: DashMap::new(),
            timeout,
        }
    }

    /// Whether the current task is already running a job for `key`.
    pub(crate) fn is_inside(key: &str) -> bool {
        ACTIVE_JOB
            .try_with(|active| active.key == key)
            .unwrap_or(false)
    }

    /// Inside a job for some other key, record `work` on `key` as deferred
    /// and return true. Outside any job, or inside `key`'s own job, return
    /// false: the caller can do the work now.
    pub(crate) fn defer(key: &str, work: Deferred) -> bool {
        ACTIVE_JOB
            .try_with(|active| {
                if active.key == key {
                    return false;
                }
                let mut deferred = active.deferred.lock().unwrap_or_else(PoisonError::into_inner);
                if !deferred.iter().any(|(k, w)| k == key && *w == work) {
                    deferred.push((key.to_owned(), work));
                }
                true
            })
            .unwrap_or(false)
    }

    /// Run `job` in `key`'s queue. Nested calls for the same key from inside
    /// a job run inline, since waiting for our own turn would never finish;
    /// their deferred keys stay with the outer job.
    pub(crate) async fn run<T, F>(&self, key: &str, job: F) -> Completed<T>
    where
        F: Future<Output = Result<T, StoreError>>,
    {
        if Self::is_inside(key) {
            return Completed {
                result: job.await,
                deferred: Vec::new(),
            };
        }

        let queue = Arc::clone(
            self.queues
                .entry(key.to_owned())
                .or_insert_with(|| Arc::new(TaskQueue::default()))
                .value(),
        );
        let deferred = Arc::new(StdMutex::new(Vec::new()));
        let active = ActiveJob {
            key: key.to_owned(),
            deferred: Arc::clone(&deferred),
        };

        let result = {
            let _turn = queue.turn.lock().await;
            debug!(address = key, "session job started");
            match tokio::time::timeout(self.timeout, ACTIVE_JOB.scope(active, job)).await {
                Ok(result) => result,
                Err(_) => {
                    warn!(address = key, timeout = ?self.timeout, "session job timed out");
                    Err(StoreError::SessionJobTimeout {
                        address: key.to_owned(),
                        timeout: self.timeout,
                    })
                }
            }
        };
        let deferred = std::mem::take(&mut *deferred.lock().unwrap_or_else(PoisonError::into_inner));
        Completed { result, deferred }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.queues.len()
    }
}

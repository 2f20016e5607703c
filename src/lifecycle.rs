// Copyright (c) 2025, The Ruskit Authors
// MIT License
// All rights reserved.

//! # Lifecycle Primitives
//!
//! Small synchronization pieces shared by the connection monitor and the engines:
//!
//! - [`Latch`]: runs an async operation at most once and hands its outcome to
//!   every caller, including callers that arrive while it is still running.
//! - [`CompletionSignal`]: single-producer single-consumer completion of an
//!   engine run.
//! - [`EngineTracker`]: counts live engines so the connection can wait for them.

use std::{
    future::Future,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};
use tokio::sync::{oneshot, Mutex as AsyncMutex, Notify};

enum LatchState<T> {
    NotStarted,
    InProgress,
    Done(T),
}

/// Tri-state one-shot guard: `NotStarted -> InProgress -> Done`.
pub(crate) struct Latch<T: Clone> {
    state: Mutex<LatchState<T>>,
    finished: Notify,
}

impl<T: Clone> Latch<T> {
    pub(crate) fn new() -> Self {
        Latch {
            state: Mutex::new(LatchState::NotStarted),
            finished: Notify::new(),
        }
    }

    /// Runs `op` if nobody has yet; otherwise waits for and returns its outcome.
    pub(crate) async fn run<F, Fut>(&self, op: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        loop {
            let notified = self.finished.notified();
            tokio::pin!(notified);

            {
                let mut state = lock(&self.state);
                match &*state {
                    LatchState::Done(outcome) => return outcome.clone(),
                    LatchState::NotStarted => {
                        *state = LatchState::InProgress;
                        break;
                    }
                    LatchState::InProgress => {
                        // registered before the lock is released so a concurrent
                        // completion cannot be missed
                        notified.as_mut().enable();
                    }
                }
            }

            notified.await;
        }

        let mut reset = ResetOnDrop {
            latch: self,
            armed: true,
        };
        let outcome = op().await;
        reset.armed = false;

        *lock(&self.state) = LatchState::Done(outcome.clone());
        self.finished.notify_waiters();
        outcome
    }
}

/// Puts an abandoned run back to `NotStarted` so the next caller runs `op`.
struct ResetOnDrop<'a, T: Clone> {
    latch: &'a Latch<T>,
    armed: bool,
}

impl<T: Clone> Drop for ResetOnDrop<'_, T> {
    fn drop(&mut self) {
        if self.armed {
            *lock(&self.latch.state) = LatchState::NotStarted;
            self.latch.finished.notify_waiters();
        }
    }
}

pub(crate) type Outcome = Result<(), crate::errors::AmqpError>;

/// One engine run reporting its result to the engine's cancel path.
pub(crate) struct CompletionSignal {
    sender: Mutex<Option<oneshot::Sender<Outcome>>>,
    receiver: AsyncMutex<Option<oneshot::Receiver<Outcome>>>,
}

impl CompletionSignal {
    pub(crate) fn new() -> Self {
        let (tx, rx) = oneshot::channel();
        CompletionSignal {
            sender: Mutex::new(Some(tx)),
            receiver: AsyncMutex::new(Some(rx)),
        }
    }

    /// Claims the sending side for a run. `None` once the signal was claimed
    /// or abandoned.
    pub(crate) fn begin(&self) -> Option<oneshot::Sender<Outcome>> {
        lock(&self.sender).take()
    }

    /// Drops the sending side if no run claimed it, completing the signal.
    pub(crate) fn abandon(&self) {
        lock(&self.sender).take();
    }

    /// Waits for the run's outcome. A run that never reported counts as success.
    /// Only the first caller to see it resolve observes the outcome; a wait
    /// dropped before that leaves the receiver in place.
    pub(crate) async fn wait(&self) -> Outcome {
        let mut receiver = self.receiver.lock().await;
        let Some(rx) = receiver.as_mut() else {
            return Ok(());
        };

        let outcome = rx.await.unwrap_or(Ok(()));
        *receiver = None;
        outcome
    }
}

/// Counts engines that still hold a channel on the connection.
#[derive(Clone, Default)]
pub(crate) struct EngineTracker {
    inner: Arc<TrackerInner>,
}

#[derive(Default)]
struct TrackerInner {
    live: AtomicUsize,
    idle: Notify,
}

impl EngineTracker {
    pub(crate) fn new() -> Self {
        EngineTracker::default()
    }

    pub(crate) fn register(&self) -> EngineGuard {
        self.inner.live.fetch_add(1, Ordering::SeqCst);
        EngineGuard {
            inner: self.inner.clone(),
        }
    }

    pub(crate) fn live(&self) -> usize {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Waits until every registered engine has been released.
    pub(crate) async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.live() == 0 {
                return;
            }
            notified.await;
        }
    }
}

/// Registration of one engine; released on drop.
pub(crate) struct EngineGuard {
    inner: Arc<TrackerInner>,
}

impl Drop for EngineGuard {
    fn drop(&mut self) {
        if self.inner.live.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.inner.idle.notify_waiters();
        }
    }
}

pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

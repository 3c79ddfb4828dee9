// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! One-shot deferred work with synchronous cancellation.
//!
//! [`DeferredWork`] runs a single task on its own worker thread once a delay
//! has elapsed. Tearing it down with [`DeferredWork::cancel_and_join`] (or by
//! dropping it) guarantees the task is either never started or has fully
//! finished, so anything the task references can be released afterwards.

use parking_lot::Condvar;
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use thiserror::Error;

/// Lifecycle of a scheduled task.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum TaskState {
    /// Armed, waiting for the delay to elapse.
    Pending,
    /// The task body is executing.
    Running,
    /// The task body has returned.
    Completed,
    /// Cancelled before it fired. The task body never ran.
    Cancelled,
}

/// Errors from [`DeferredWork::schedule`].
#[derive(Debug, Error)]
pub enum ScheduleError {
    /// A task was already scheduled on this instance.
    #[error("deferred work {0} was already scheduled")]
    AlreadyScheduled(Arc<str>),
    /// The worker thread could not be created.
    #[error("failed to spawn worker for deferred work {name}")]
    Spawn {
        /// The name of the deferred work.
        name: Arc<str>,
        /// The spawn failure.
        #[source]
        source: std::io::Error,
    },
}

struct Shared {
    state: Mutex<Option<TaskState>>,
    cond: Condvar,
}

/// A single deferred task.
///
/// At most one task is ever scheduled per instance.
pub struct DeferredWork {
    name: Arc<str>,
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl DeferredWork {
    /// Creates an instance with nothing scheduled.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            name: name.into(),
            shared: Arc::new(Shared {
                state: Mutex::new(None),
                cond: Condvar::new(),
            }),
            worker: None,
        }
    }

    /// Returns the task's state, or `None` if nothing was scheduled.
    pub fn state(&self) -> Option<TaskState> {
        *self.shared.state.lock()
    }

    /// Arms `task` to run once, no earlier than `delay` from now.
    ///
    /// The task runs with the caller's tracing dispatcher and current span. A
    /// delay too large to represent as an [`Instant`] never fires; the task
    /// stays pending until cancelled.
    pub fn schedule(
        &mut self,
        delay: Duration,
        task: impl FnOnce() + Send + 'static,
    ) -> Result<(), ScheduleError> {
        let deadline = Instant::now().checked_add(delay);
        {
            let mut state = self.shared.state.lock();
            if state.is_some() {
                return Err(ScheduleError::AlreadyScheduled(self.name.clone()));
            }
            *state = Some(TaskState::Pending);
        }

        let shared = self.shared.clone();
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let span = tracing::Span::current();
        let spawned = std::thread::Builder::new()
            .name(self.name.to_string())
            .spawn(move || {
                if !wait_for_deadline(&shared, deadline) {
                    return;
                }
                tracing::dispatcher::with_default(&dispatch, || span.in_scope(task));
                *shared.state.lock() = Some(TaskState::Completed);
            });

        match spawned {
            Ok(worker) => {
                self.worker = Some(worker);
                Ok(())
            }
            Err(source) => {
                *self.shared.state.lock() = Some(TaskState::Cancelled);
                Err(ScheduleError::Spawn {
                    name: self.name.clone(),
                    source,
                })
            }
        }
    }

    /// Cancels the task if it has not started, otherwise waits for it to
    /// finish. Returns the final state, or `None` if nothing was scheduled.
    ///
    /// Must not be called from within the task itself.
    pub fn cancel_and_join(&mut self) -> Option<TaskState> {
        {
            let mut state = self.shared.state.lock();
            if *state == Some(TaskState::Pending) {
                *state = Some(TaskState::Cancelled);
                self.shared.cond.notify_all();
            }
        }
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::error!(name = %self.name, "deferred work panicked");
                // The body did not return normally, but it will not run again.
                *self.shared.state.lock() = Some(TaskState::Completed);
            }
        }
        self.state()
    }
}

/// Blocks until `deadline`, or until cancelled if there is none. Returns
/// true if the task should now run, having moved it to
/// [`TaskState::Running`], or false if it was cancelled.
fn wait_for_deadline(shared: &Shared, deadline: Option<Instant>) -> bool {
    let mut state = shared.state.lock();
    while *state == Some(TaskState::Pending) {
        match deadline {
            Some(deadline) => {
                if shared.cond.wait_until(&mut state, deadline).timed_out() {
                    break;
                }
            }
            None => shared.cond.wait(&mut state),
        }
    }
    if *state != Some(TaskState::Pending) {
        return false;
    }
    *state = Some(TaskState::Running);
    true
}

impl Drop for DeferredWork {
    fn drop(&mut self) {
        self.cancel_and_join();
    }
}

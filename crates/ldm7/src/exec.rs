//! Executor for long-running session tasks.
//!
//! Tasks are submitted with a non-blocking halt hook and their outcomes are
//! collected in *completion order*, not submission order. The halt hook is
//! invoked at most once; it must cause the task to return in bounded time,
//! typically by triggering the [`HaltFlag`] the task selects on.

use crate::error::{Ldm7Error, Result};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::sync::Notify;

/// Cancellation flag a task observes at every blocking boundary.
#[derive(Clone)]
pub struct HaltFlag {
    inner: Arc<HaltInner>,
}

struct HaltInner {
    flagged: AtomicBool,
    notify: Notify,
}

impl HaltFlag {
    pub fn new() -> HaltFlag {
        HaltFlag {
            inner: Arc::new(HaltInner {
                flagged: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    /// Trips the flag and wakes every `cancelled()` waiter. Idempotent.
    pub fn trigger(&self) {
        self.inner.flagged.store(true, Ordering::Release);
        self.inner.notify.notify_waiters();
    }

    #[inline]
    pub fn is_triggered(&self) -> bool {
        self.inner.flagged.load(Ordering::Acquire)
    }

    /// Resolves once the flag is tripped.
    pub async fn cancelled(&self) {
        while !self.is_triggered() {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.is_triggered() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for HaltFlag {
    fn default() -> Self {
        Self::new()
    }
}

/// Handle to a submitted task.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TaskFuture {
    id: u64,
    name: String,
}

impl TaskFuture {
    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A finished task: its handle and its outcome.
#[derive(Debug)]
pub struct Completion {
    pub future: TaskFuture,
    pub result: Result<()>,
}

struct Active {
    name: String,
    halt: Option<Box<dyn FnOnce() + Send>>,
}

/// Runs session tasks and surfaces their completions oldest-first.
pub struct Executor {
    tx: mpsc::UnboundedSender<(u64, Result<()>)>,
    rx: mpsc::UnboundedReceiver<(u64, Result<()>)>,
    active: HashMap<u64, Active>,
    next_id: u64,
}

impl Executor {
    pub fn new() -> Executor {
        let (tx, rx) = mpsc::unbounded_channel();
        Executor {
            tx,
            rx,
            active: HashMap::new(),
            next_id: 0,
        }
    }

    /// Schedules `task`. `halt` must be non-blocking and cause the task to
    /// return promptly; it is invoked at most once, by [`Executor::cancel`]
    /// or [`Executor::shutdown`].
    pub fn submit<F>(
        &mut self,
        name: impl Into<String>,
        task: F,
        halt: impl FnOnce() + Send + 'static,
    ) -> TaskFuture
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.next_id += 1;
        let id = self.next_id;
        let tx = self.tx.clone();
        tokio::spawn(async move {
            let result = task.await;
            // The executor may already be gone during teardown.
            let _ = tx.send((id, result));
        });
        self.active.insert(
            id,
            Active {
                name: name.clone(),
                halt: Some(Box::new(halt)),
            },
        );
        TaskFuture { id, name }
    }

    /// Number of tasks not yet collected.
    pub fn active_count(&self) -> usize {
        self.active.len()
    }

    /// Waits for the oldest uncollected completion. Returns `None` when no
    /// tasks are active.
    pub async fn wait(&mut self) -> Option<Completion> {
        if self.active.is_empty() {
            return None;
        }
        loop {
            let (id, result) = self.rx.recv().await?;
            // A cancelled-and-collected task may still send; skip strays.
            if let Some(active) = self.active.remove(&id) {
                return Some(Completion {
                    future: TaskFuture {
                        id,
                        name: active.name,
                    },
                    result,
                });
            }
        }
    }

    /// Invokes the task's halt hook without waiting for it to finish.
    pub fn cancel(&mut self, future: &TaskFuture) {
        if let Some(active) = self.active.get_mut(&future.id) {
            if let Some(halt) = active.halt.take() {
                halt();
            }
        }
    }

    /// Halts every active task and drains all completions. The first error
    /// that is not a shutdown is returned.
    pub async fn shutdown(&mut self) -> Result<()> {
        for active in self.active.values_mut() {
            if let Some(halt) = active.halt.take() {
                halt();
            }
        }
        let mut first_error: Option<Ldm7Error> = None;
        while let Some(done) = self.wait().await {
            if let Err(e) = done.result {
                if !e.is_shutdown() && first_error.is_none() {
                    first_error = Some(e);
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

impl Default for Executor {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn single_task_completes() {
        let mut exec = Executor::new();
        let fut = exec.submit("quick", async { Ok(()) }, || {});
        let done = exec.wait().await.unwrap();
        assert_eq!(done.future, fut);
        assert!(done.result.is_ok());
        assert_eq!(exec.active_count(), 0);
        assert!(exec.wait().await.is_none());
    }

    #[tokio::test]
    async fn completions_arrive_in_completion_order() {
        let mut exec = Executor::new();
        let slow = exec.submit(
            "slow",
            async {
                tokio::time::sleep(Duration::from_millis(100)).await;
                Ok(())
            },
            || {},
        );
        let fast = exec.submit("fast", async { Ok(()) }, || {});
        assert_eq!(exec.wait().await.unwrap().future, fast);
        assert_eq!(exec.wait().await.unwrap().future, slow);
    }

    #[tokio::test]
    async fn cancel_invokes_halt_once() {
        let mut exec = Executor::new();
        let halt = HaltFlag::new();
        let observed = halt.clone();
        let fut = exec.submit(
            "cancellable",
            async move {
                observed.cancelled().await;
                Err(Ldm7Error::Shutdown)
            },
            {
                let halt = halt.clone();
                move || halt.trigger()
            },
        );
        exec.cancel(&fut);
        exec.cancel(&fut); // second call is a no-op
        let done = exec.wait().await.unwrap();
        assert!(done.result.unwrap_err().is_shutdown());
    }

    #[tokio::test]
    async fn shutdown_halts_everything_and_reports_first_error() {
        let mut exec = Executor::new();
        for n in 0..3 {
            let halt = HaltFlag::new();
            let observed = halt.clone();
            exec.submit(
                format!("worker-{n}"),
                async move {
                    observed.cancelled().await;
                    Err(Ldm7Error::Shutdown)
                },
                {
                    let halt = halt.clone();
                    move || halt.trigger()
                },
            );
        }
        assert!(exec.shutdown().await.is_ok());
        assert_eq!(exec.active_count(), 0);
    }

    #[tokio::test]
    async fn halt_flag_wakes_pending_waiter() {
        let halt = HaltFlag::new();
        let waiter = {
            let halt = halt.clone();
            tokio::spawn(async move { halt.cancelled().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        halt.trigger();
        waiter.await.unwrap();
        assert!(halt.is_triggered());
    }
}

//! Session task supervision: first error wins.

use crate::error::{Ldm7Error, Result};
use crate::exec::{Completion, Executor, TaskFuture};
use std::future::Future;

/// Runs a session's tasks and reports the first meaningful completion.
///
/// One-shot tasks (the backlog requester) may be marked benign: their
/// successful completion does not end the session.
pub struct Supervisor {
    exec: Executor,
    benign: Vec<String>,
    first_error: Option<Ldm7Error>,
}

impl Supervisor {
    pub fn new() -> Supervisor {
        Supervisor {
            exec: Executor::new(),
            benign: Vec::new(),
            first_error: None,
        }
    }

    /// Submits a session task.
    pub fn start_task<F>(
        &mut self,
        name: impl Into<String>,
        task: F,
        halt: impl FnOnce() + Send + 'static,
    ) -> TaskFuture
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.exec.submit(name, task, halt)
    }

    /// Like [`Supervisor::start_task`], but a successful completion is not
    /// a session-ending event.
    pub fn start_oneshot<F>(
        &mut self,
        name: impl Into<String>,
        task: F,
        halt: impl FnOnce() + Send + 'static,
    ) -> TaskFuture
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let name = name.into();
        self.benign.push(name.clone());
        self.exec.submit(name, task, halt)
    }

    /// Blocks until a session-ending completion: any error, or the success
    /// of a non-benign task. Benign successes are logged and skipped.
    pub async fn wait_on_tasks(&mut self) -> Option<Completion> {
        while let Some(done) = self.exec.wait().await {
            match &done.result {
                Ok(()) if self.benign.iter().any(|n| n == done.future.name()) => {
                    tracing::debug!(task = done.future.name(), "one-shot task finished");
                    continue;
                }
                Ok(()) => return Some(done),
                Err(e) => {
                    if self.first_error.is_none() && !e.is_shutdown() {
                        self.first_error = Some(clone_error(e));
                    }
                    return Some(done);
                }
            }
        }
        None
    }

    /// Halts every remaining task and joins them, accumulating the first
    /// error if none was recorded yet.
    pub async fn terminate_tasks(&mut self) {
        if let Err(e) = self.exec.shutdown().await {
            if self.first_error.is_none() && !e.is_shutdown() {
                self.first_error = Some(e);
            }
        }
    }

    /// The first non-shutdown error observed this session, if any.
    pub fn take_first_error(&mut self) -> Option<Ldm7Error> {
        self.first_error.take()
    }

    pub fn active_count(&self) -> usize {
        self.exec.active_count()
    }
}

impl Default for Supervisor {
    fn default() -> Self {
        Self::new()
    }
}

// Ldm7Error is not Clone (it wraps io::Error); the supervisor only needs a
// faithful rendering for the session report.
fn clone_error(e: &Ldm7Error) -> Ldm7Error {
    match e {
        Ldm7Error::Shutdown => Ldm7Error::Shutdown,
        Ldm7Error::Timeout(m) => Ldm7Error::Timeout(m.clone()),
        Ldm7Error::Corrupt(m) => Ldm7Error::Corrupt(m.clone()),
        other => Ldm7Error::Invalid(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exec::HaltFlag;
    use std::time::Duration;

    #[tokio::test]
    async fn first_error_wins() {
        let mut sup = Supervisor::new();
        let halt = HaltFlag::new();
        let observed = halt.clone();
        sup.start_task(
            "healthy",
            async move {
                observed.cancelled().await;
                Err(Ldm7Error::Shutdown)
            },
            {
                let halt = halt.clone();
                move || halt.trigger()
            },
        );
        sup.start_task(
            "failing",
            async {
                tokio::time::sleep(Duration::from_millis(10)).await;
                Err(Ldm7Error::Timeout("probe".into()))
            },
            || {},
        );

        let done = sup.wait_on_tasks().await.unwrap();
        assert_eq!(done.future.name(), "failing");
        sup.terminate_tasks().await;
        assert!(matches!(sup.take_first_error(), Some(Ldm7Error::Timeout(_))));
        assert_eq!(sup.active_count(), 0);
    }

    #[tokio::test]
    async fn benign_oneshot_success_does_not_end_session() {
        let mut sup = Supervisor::new();
        sup.start_oneshot("oneshot", async { Ok(()) }, || {});
        let halt = HaltFlag::new();
        let observed = halt.clone();
        sup.start_task(
            "long",
            async move {
                observed.cancelled().await;
                Ok(())
            },
            {
                let halt = halt.clone();
                move || halt.trigger()
            },
        );
        // The one-shot finishes immediately but must be skipped; halt the
        // long task so wait_on_tasks returns it instead.
        halt.trigger();
        let done = sup.wait_on_tasks().await.unwrap();
        assert_eq!(done.future.name(), "long");
    }
}

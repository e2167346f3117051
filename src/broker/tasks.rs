//! Supervised background tasks
//!
//! Each broker keeps its fire-and-forget work (result delivery, closing
//! rejected connections) in a `TaskGroup`. Finished tasks are reaped from the
//! broker's select loop so the group only ever holds work in flight; on
//! shutdown everything left is aborted and awaited.

use std::future::Future;

use tokio::task::JoinSet;

use crate::session::Connection;

/// Set of in-flight tasks owned by one broker
#[derive(Debug)]
pub struct TaskGroup {
    name: &'static str,
    set: JoinSet<()>,
}

impl TaskGroup {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            set: JoinSet::new(),
        }
    }

    /// Start a task in this group
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.set.spawn(task);
    }

    /// Close a connection this broker no longer wants, off the select loop
    pub fn close_later(&mut self, mut connection: Connection) {
        self.spawn(async move { connection.close().await });
    }

    /// Number of tasks not yet reaped
    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for the next task to finish and deregister it
    ///
    /// Returns `None` when the group is empty. Panics inside a task are
    /// logged, never propagated.
    pub async fn reap(&mut self) -> Option<()> {
        match self.set.join_next().await? {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {
                tracing::trace!(group = self.name, "Task cancelled");
            }
            Err(e) => {
                tracing::error!(group = self.name, error = %e, "Task panicked");
            }
        }
        Some(())
    }

    /// Abort every task and wait until all have stopped
    pub async fn shutdown(&mut self) {
        let in_flight = self.set.len();
        self.set.shutdown().await;
        if in_flight > 0 {
            tracing::debug!(group = self.name, tasks = in_flight, "Task group stopped");
        }
    }
}

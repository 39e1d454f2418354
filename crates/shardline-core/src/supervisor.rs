//! Structured-concurrency task groups.
//!
//! A [`TaskGroup`] owns a set of spawned tasks and a cancel token shared by
//! all of them. The first task that fails cancels the token so its siblings
//! wind down, and [`TaskGroup::wait`] reports that first failure once every
//! task has been joined.

use std::future::Future;

use tokio::task::{JoinError, JoinSet};

use crate::cancel::CancelToken;
use crate::error::Error;

/// A supervised set of tasks sharing one cancel token.
#[derive(Debug)]
pub struct TaskGroup<E> {
    token: CancelToken,
    tasks: JoinSet<Result<(), E>>,
}

impl<E> TaskGroup<E>
where
    E: From<Error> + Send + 'static,
{
    /// Creates an empty group cancelled through `token`.
    #[must_use]
    pub fn new(token: CancelToken) -> Self {
        Self {
            token,
            tasks: JoinSet::new(),
        }
    }

    /// Returns the token every task of the group should observe.
    #[must_use]
    pub const fn token(&self) -> &CancelToken {
        &self.token
    }

    /// Returns the number of tasks not yet joined.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no tasks are left to join.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawns a task into the group.
    pub fn spawn<F>(&mut self, task: F)
    where
        F: Future<Output = Result<(), E>> + Send + 'static,
    {
        self.tasks.spawn(task);
    }

    /// Cancels every task of the group.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Waits for the next task to finish. Returns `None` once the group is empty.
    ///
    /// A failing task cancels the group. Cancel safe.
    pub async fn join_next(&mut self) -> Option<Result<(), E>> {
        let joined = self.tasks.join_next().await?;
        let result = flatten(joined);
        if result.is_err() {
            self.token.cancel();
        }
        Some(result)
    }

    /// Joins every task and returns the first failure.
    ///
    /// # Errors
    ///
    /// Returns the error of the first task that failed or panicked.
    pub async fn wait(&mut self) -> Result<(), E> {
        let mut first = None;
        while let Some(result) = self.join_next().await {
            if let Err(err) = result {
                first.get_or_insert(err);
            }
        }
        first.map_or(Ok(()), Err)
    }

    /// Cancels the group, then joins every task.
    ///
    /// # Errors
    ///
    /// Returns the error of the first task that failed or panicked.
    pub async fn shutdown(&mut self) -> Result<(), E> {
        self.cancel();
        self.wait().await
    }
}

fn flatten<E: From<Error>>(joined: Result<Result<(), E>, JoinError>) -> Result<(), E> {
    match joined {
        Ok(result) => result,
        Err(err) if err.is_cancelled() => Ok(()),
        Err(err) => Err(Error::internal(format!("task panicked: {err}")).into()),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_wait_succeeds_when_all_tasks_succeed() {
        let mut group: TaskGroup<Error> = TaskGroup::new(CancelToken::new());
        group.spawn(async { Ok(()) });
        group.spawn(async { Ok(()) });

        group.wait().await.expect("group should succeed");
        assert!(group.is_empty());
    }

    #[tokio::test]
    async fn test_first_failure_cancels_siblings() {
        let mut group: TaskGroup<Error> = TaskGroup::new(CancelToken::new());

        let token = group.token().clone();
        group.spawn(async move {
            token.cancelled().await;
            Ok(())
        });
        group.spawn(async { Err(Error::internal("boom")) });

        let err = group.wait().await.expect_err("group should fail");
        assert!(matches!(err, Error::Internal { .. }));
        assert!(group.token().is_cancelled());
    }

    #[tokio::test]
    async fn test_panic_is_reported_as_error() {
        let mut group: TaskGroup<Error> = TaskGroup::new(CancelToken::new());
        group.spawn(async { panic!("task exploded") });

        let err = group.wait().await.expect_err("group should fail");
        assert!(err.to_string().contains("task panicked"));
    }

    #[tokio::test]
    async fn test_shutdown_stops_long_running_tasks() {
        let mut group: TaskGroup<Error> = TaskGroup::new(CancelToken::new());
        let token = group.token().clone();
        group.spawn(async move {
            tokio::select! {
                () = token.cancelled() => Ok(()),
                () = tokio::time::sleep(Duration::from_secs(3600)) => Err(Error::internal("not cancelled")),
            }
        });

        group.shutdown().await.expect("shutdown should succeed");
    }
}

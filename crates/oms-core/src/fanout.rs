//! Labeled parallel tasks with a full barrier.
//!
//! Every spawned task runs to completion. Results come back owned by the
//! coordinator, which decides what to do with them; workers never touch
//! shared state.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;

/// Failures of one fan-out, one entry per failed task.
#[derive(Debug)]
pub struct AggregateError {
    what: String,
    failures: Vec<(String, anyhow::Error)>,
}

impl AggregateError {
    pub fn failures(&self) -> &[(String, anyhow::Error)] {
        &self.failures
    }

    /// Labels of the failed tasks, sorted.
    pub fn labels(&self) -> Vec<&str> {
        let mut labels: Vec<&str> = self.failures.iter().map(|(l, _)| l.as_str()).collect();
        labels.sort_unstable();
        labels
    }
}

impl fmt::Display for AggregateError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} of {} failed:", self.failures.len(), self.what)?;
        for (label, error) in &self.failures {
            write!(f, "\n  {label}: {error:#}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AggregateError {}

pub struct FanOut<T> {
    what: String,
    set: JoinSet<(String, anyhow::Result<T>)>,
    semaphore: Option<Arc<Semaphore>>,
}

impl<T: Send + 'static> FanOut<T> {
    /// `what` names the batch in error messages, e.g. "API enablements".
    pub fn new(what: impl Into<String>) -> Self {
        Self {
            what: what.into(),
            set: JoinSet::new(),
            semaphore: None,
        }
    }

    /// Cap the number of tasks running at once.
    pub fn with_parallelism(mut self, max_parallelism: usize) -> Self {
        self.semaphore = Some(Arc::new(Semaphore::new(max_parallelism.max(1))));
        self
    }

    pub fn spawn<F>(&mut self, label: impl Into<String>, task: F)
    where
        F: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        let label = label.into();
        let semaphore = self.semaphore.clone();
        self.set.spawn(async move {
            let _permit = match semaphore {
                Some(semaphore) => match semaphore.acquire_owned().await {
                    Ok(permit) => Some(permit),
                    Err(e) => return (label, Err(e.into())),
                },
                None => None,
            };
            let result = task.await;
            (label, result)
        });
    }

    pub fn len(&self) -> usize {
        self.set.len()
    }

    pub fn is_empty(&self) -> bool {
        self.set.is_empty()
    }

    /// Wait for every task. Successes are returned in completion order.
    pub async fn join(mut self) -> Result<Vec<(String, T)>, AggregateError> {
        let mut successes = Vec::new();
        let mut failures = Vec::new();
        while let Some(joined) = self.set.join_next().await {
            match joined {
                Ok((label, Ok(value))) => successes.push((label, value)),
                Ok((label, Err(error))) => failures.push((label, error)),
                Err(join_error) => {
                    failures.push(("<task>".to_string(), anyhow::Error::new(join_error)))
                }
            }
        }
        if failures.is_empty() {
            Ok(successes)
        } else {
            failures.sort_by(|a, b| a.0.cmp(&b.0));
            Err(AggregateError {
                what: self.what,
                failures,
            })
        }
    }
}

//! Concurrent job fan-out with a named failure policy.

use std::fmt;
use std::future::Future;
use std::str::FromStr;

use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

/// How a group reacts when one of its jobs fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FailurePolicy {
    /// The first failure cancels the group token, aborting sibling jobs at
    /// their next blocking step.
    #[default]
    FailFast,

    /// Every job runs to completion regardless of sibling failures.
    Isolate,
}

impl fmt::Display for FailurePolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailurePolicy::FailFast => write!(f, "fail-fast"),
            FailurePolicy::Isolate => write!(f, "isolate"),
        }
    }
}

/// Error returned when parsing an unknown policy name.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unknown failure policy {0:?}: expected \"fail-fast\" or \"isolate\"")]
pub struct ParsePolicyError(pub String);

impl FromStr for FailurePolicy {
    type Err = ParsePolicyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "fail-fast" | "failfast" => Ok(FailurePolicy::FailFast),
            "isolate" => Ok(FailurePolicy::Isolate),
            other => Err(ParsePolicyError(other.to_string())),
        }
    }
}

/// Result of joining a [`TaskGroup`].
#[derive(Debug)]
pub struct GroupOutcome<T, E> {
    /// Values of jobs that succeeded, in completion order.
    pub succeeded: Vec<T>,

    /// Errors of jobs that failed, in completion order. Under
    /// [`FailurePolicy::FailFast`] the first entry is the one that
    /// cancelled the group.
    pub failures: Vec<E>,

    /// Jobs that panicked.
    pub panicked: usize,

    /// True if a panic was the first failure observed.
    pub panicked_first: bool,
}

impl<T, E> GroupOutcome<T, E> {
    fn empty() -> Self {
        Self {
            succeeded: Vec::new(),
            failures: Vec::new(),
            panicked: 0,
            panicked_first: false,
        }
    }

    /// Returns true if every job succeeded.
    pub fn is_success(&self) -> bool {
        self.failures.is_empty() && self.panicked == 0
    }

    /// The first failure observed.
    pub fn first_error(&self) -> Option<&E> {
        self.failures.first()
    }

    /// Consumes the outcome, returning the first failure.
    pub fn into_first_error(self) -> Option<E> {
        self.failures.into_iter().next()
    }
}

/// A set of concurrently running jobs sharing one cancellation token.
///
/// The group token is a child of the caller's token: cancelling the caller
/// cancels every job, while the group cancelling itself leaves the caller
/// untouched.
pub struct TaskGroup<T, E> {
    policy: FailurePolicy,
    token: CancellationToken,
    tasks: JoinSet<Result<T, E>>,
}

impl<T, E> TaskGroup<T, E>
where
    T: Send + 'static,
    E: Send + 'static,
{
    /// Create an empty group under `parent`.
    pub fn new(parent: &CancellationToken, policy: FailurePolicy) -> Self {
        Self {
            policy,
            token: parent.child_token(),
            tasks: JoinSet::new(),
        }
    }

    /// Number of jobs not yet joined.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Returns true if no jobs are pending.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn a job. The closure receives the group token.
    pub fn spawn<F, Fut>(&mut self, job: F)
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, E>> + Send + 'static,
    {
        let token = self.token.clone();
        self.tasks.spawn(job(token));
    }

    /// Wait for every job, applying the failure policy as results arrive.
    pub async fn join(mut self) -> GroupOutcome<T, E> {
        let mut outcome = GroupOutcome::empty();

        while let Some(joined) = self.tasks.join_next().await {
            match joined {
                Ok(Ok(value)) => outcome.succeeded.push(value),
                Ok(Err(err)) => {
                    self.on_failure();
                    outcome.failures.push(err);
                }
                Err(join_err) => {
                    error!(error = %join_err, "Task group job panicked");
                    self.on_failure();
                    if outcome.is_success() {
                        outcome.panicked_first = true;
                    }
                    outcome.panicked += 1;
                }
            }
        }

        outcome
    }

    fn on_failure(&self) {
        if self.policy == FailurePolicy::FailFast && !self.token.is_cancelled() {
            debug!(pending = self.tasks.len(), "Cancelling task group after failure");
            self.token.cancel();
        }
    }
}

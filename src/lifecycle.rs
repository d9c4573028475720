//! Supervision of the actor and the poll scheduler.

use std::future::Future;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error};

use crate::error::Error;

/// Observes the consumer's terminal outcome.
///
/// `None` while the consumer is running; once it terminates, every clone
/// sees the same `Ok`/`Err` outcome.
#[derive(Clone)]
pub(crate) struct TerminationWatch {
    outcome: watch::Receiver<Option<Result<(), Error>>>,
}

impl TerminationWatch {
    /// Wait until the consumer has terminated and return its outcome.
    pub async fn wait(&mut self) -> Result<(), Error> {
        loop {
            if let Some(outcome) = self.outcome.borrow().clone() {
                return outcome;
            }
            if self.outcome.changed().await.is_err() {
                return Err(Error::Shutdown);
            }
        }
    }
}

/// Ties the actor task and the poll scheduler task together: whichever
/// finishes first takes the other down with it, and the combined outcome is
/// published for `await_termination`.
pub(crate) struct Lifecycle {
    shutdown: watch::Sender<bool>,
    outcome: watch::Receiver<Option<Result<(), Error>>>,
    _supervisor: JoinHandle<()>,
}

impl Lifecycle {
    pub fn spawn<A, S>(actor: A, scheduler: S, shutdown: watch::Sender<bool>) -> Self
    where
        A: Future<Output = Result<(), Error>> + Send + 'static,
        S: Future<Output = ()> + Send + 'static,
    {
        let (outcome_tx, outcome_rx) = watch::channel(None);
        let mut actor_task = tokio::spawn(actor);
        let mut scheduler_task = tokio::spawn(scheduler);

        let supervisor = tokio::spawn(async move {
            let outcome = tokio::select! {
                result = &mut actor_task => {
                    scheduler_task.abort();
                    flatten(result)
                }
                result = &mut scheduler_task => {
                    // The scheduler only stops when shutdown was signalled or
                    // the actor's queues are gone, so the actor is already on
                    // its way out; wait for it rather than cutting its
                    // cleanup short. A panicked scheduler tears it down hard.
                    if result.is_err() {
                        actor_task.abort();
                    }
                    flatten(actor_task.await)
                }
            };
            match &outcome {
                Ok(()) => debug!("consumer terminated"),
                Err(reason) => error!(%reason, "consumer failed"),
            }
            let _ = outcome_tx.send(Some(outcome));
        });

        Self {
            shutdown,
            outcome: outcome_rx,
            _supervisor: supervisor,
        }
    }

    /// Ask both tasks to stop. Idempotent; actual termination is observed
    /// through [`Lifecycle::termination_watch`].
    pub fn terminate(&self) {
        let _ = self.shutdown.send(true);
    }

    pub fn termination_watch(&self) -> TerminationWatch {
        TerminationWatch {
            outcome: self.outcome.clone(),
        }
    }
}

impl Drop for Lifecycle {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn flatten(result: Result<Result<(), Error>, tokio::task::JoinError>) -> Result<(), Error> {
    match result {
        Ok(outcome) => outcome,
        // Cancelled or panicked mid-flight; either way the consumer is gone.
        Err(_) => Err(Error::Shutdown),
    }
}

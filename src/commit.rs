//! The caller side of the commit pipeline.

use std::time::Duration;

use tokio::sync::{mpsc, oneshot};

use crate::error::Error;
use crate::lifecycle::TerminationWatch;
use crate::request::{CommitMode, Request};
use crate::types::Offsets;

/// Submits commit requests to the actor and waits for the broker's answer,
/// racing against consumer termination and the commit timeout.
#[derive(Clone)]
pub(crate) struct Committer {
    requests: mpsc::UnboundedSender<Request>,
    termination: TerminationWatch,
    timeout: Duration,
}

impl Committer {
    pub fn new(
        requests: mpsc::UnboundedSender<Request>,
        termination: TerminationWatch,
        timeout: Duration,
    ) -> Self {
        Self {
            requests,
            termination,
            timeout,
        }
    }

    pub async fn commit_sync(&self, offsets: Offsets) -> Result<(), Error> {
        self.commit(offsets, CommitMode::Sync).await
    }

    pub async fn commit_async(&self, offsets: Offsets) -> Result<(), Error> {
        self.commit(offsets, CommitMode::Async).await
    }

    async fn commit(&self, offsets: Offsets, mode: CommitMode) -> Result<(), Error> {
        if offsets.is_empty() {
            return Ok(());
        }
        let (sink, reply) = oneshot::channel();
        self.requests
            .send(Request::Commit {
                offsets,
                mode,
                sink,
            })
            .map_err(|_| Error::Shutdown)?;

        let mut termination = self.termination.clone();
        let raced = tokio::time::timeout(self.timeout, async {
            tokio::select! {
                reply = reply => reply.unwrap_or(Err(Error::Shutdown)),
                _ = termination.wait() => Err(Error::Shutdown),
            }
        })
        .await;
        match raced {
            Ok(outcome) => outcome,
            Err(_) => Err(Error::CommitTimeout),
        }
    }
}

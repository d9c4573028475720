//! Periodic poll injection.

use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tracing::debug;

/// Offer a poll token, sleep, repeat.
///
/// The poll queue has capacity 1, so when the actor falls behind the send
/// blocks and the effective rate dampens itself instead of piling up
/// tokens. Shutdown unwinds both the send and the sleep.
pub(crate) async fn run_poll_scheduler(
    polls: mpsc::Sender<()>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            sent = polls.send(()) => {
                if sent.is_err() {
                    // Actor gone; nothing left to schedule.
                    break;
                }
            }
        }
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }
    debug!("poll scheduler stopped");
}

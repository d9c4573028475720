//! Serialized blocking access to the Kafka client.

use std::sync::{Arc, Mutex};

use crate::client::ConsumerClient;
use crate::error::Error;

/// Owns the (not thread-safe) client and hands out one operation at a time.
///
/// Every client call from any task goes through the same mutex, so the
/// actor's poll and a user-issued seek can never overlap on the client. The
/// closure runs on the blocking pool; the caller suspends until it is done.
/// Dropping the last handle drops the client, which closes it.
pub(crate) struct ConsumerHandle<C> {
    client: Arc<Mutex<C>>,
}

impl<C> Clone for ConsumerHandle<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
        }
    }
}

impl<C: ConsumerClient> ConsumerHandle<C> {
    pub fn new(client: C) -> Self {
        Self {
            client: Arc::new(Mutex::new(client)),
        }
    }

    /// Run `op` with exclusive access to the client.
    ///
    /// Panics inside the closure resume unwinding in the caller; an
    /// `Err(Error::Shutdown)` means the runtime tore the task down before
    /// it ran.
    pub async fn blocking<T, F>(&self, op: F) -> Result<T, Error>
    where
        F: FnOnce(&C) -> T + Send + 'static,
        T: Send + 'static,
    {
        let client = Arc::clone(&self.client);
        let task = tokio::task::spawn_blocking(move || {
            let guard = client.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            op(&guard)
        });
        match task.await {
            Ok(value) => Ok(value),
            Err(join_error) if join_error.is_panic() => {
                std::panic::resume_unwind(join_error.into_panic())
            }
            Err(_) => Err(Error::Shutdown),
        }
    }
}

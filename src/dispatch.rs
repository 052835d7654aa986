//! Correlation dispatch table
//!
//! One table of pending replies keyed by correlation id. A caller registers an id
//! and awaits its `PendingReply`; whoever receives the matching response calls
//! `resolve`. The first resolution wins and removes the entry; later ones for the
//! same id find nothing. Dropping a `PendingReply` deregisters it, so abandoned
//! requests never leak entries.

use crate::error::BlockError;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

/// Table of in-flight requests awaiting a `T`.
pub struct Dispatcher<T> {
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>,
}

impl<T> Clone for Dispatcher<T> {
    fn clone(&self) -> Self {
        Self {
            pending: self.pending.clone(),
        }
    }
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            pending: Arc::new(Mutex::new(HashMap::new())),
        }
    }
}

impl<T: Send + 'static> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `id`. Only one request per id may be in flight.
    pub fn register(&self, id: &str) -> Result<PendingReply<T>, BlockError> {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();
        if pending.contains_key(id) {
            return Err(BlockError::DuplicateCorrelation(id.to_string()));
        }
        pending.insert(id.to_string(), tx);
        trace!(correlation_id = id, "Registered pending reply");
        Ok(PendingReply {
            id: id.to_string(),
            rx,
            pending: self.pending.clone(),
        })
    }

    /// Delivers `value` to the request registered under `id`.
    ///
    /// Returns false when no request is waiting (already resolved, dropped or unknown).
    pub fn resolve(&self, id: &str, value: T) -> bool {
        let sender = self.pending.lock().remove(id);
        match sender {
            Some(tx) => tx.send(value).is_ok(),
            None => {
                debug!(correlation_id = id, "No pending reply for response; ignoring");
                false
            }
        }
    }

    pub fn is_pending(&self, id: &str) -> bool {
        self.pending.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Receiving half of a registered request.
pub struct PendingReply<T> {
    id: String,
    rx: oneshot::Receiver<T>,
    pending: Arc<Mutex<HashMap<String, oneshot::Sender<T>>>>,
}

impl<T> PendingReply<T> {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Waits for the reply without a deadline.
    pub async fn recv(mut self) -> Result<T, BlockError> {
        (&mut self.rx)
            .await
            .map_err(|_| BlockError::ChannelClosed(self.id.clone()))
    }

    /// Waits for the reply; `Ok(None)` when `timeout` elapses first.
    pub async fn wait(mut self, timeout: Duration) -> Result<Option<T>, BlockError> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(value)) => Ok(Some(value)),
            Ok(Err(_)) => Err(BlockError::ChannelClosed(self.id.clone())),
            Err(_) => Ok(None),
        }
    }

    /// Borrowing receive for use inside `select!` loops.
    pub fn receiver(&mut self) -> &mut oneshot::Receiver<T> {
        &mut self.rx
    }
}

impl<T> Drop for PendingReply<T> {
    fn drop(&mut self) {
        self.pending.lock().remove(&self.id);
    }
}

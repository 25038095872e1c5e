//! Pending request table: sequence number to reply slot.

use std::collections::HashMap;

use log::warn;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use htsp_protocol::{ClientError, Message};

type ReplySender = oneshot::Sender<Result<Message, ClientError>>;

/// Requests in flight on one connection, keyed by sequence number.
#[derive(Default)]
pub struct PendingRequests {
    slots: Mutex<HashMap<i32, ReplySender>>,
}

impl PendingRequests {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a slot for `seq`. The slot is removed again when the
    /// returned handle is dropped, whether or not a reply arrived.
    pub fn register(&self, seq: i32) -> PendingSlot<'_> {
        let (tx, rx) = oneshot::channel();
        if self.slots.lock().insert(seq, tx).is_some() {
            // Only reachable after the counter wrapped with a request still outstanding.
            warn!("Sequence number {} reused while a request was in flight", seq);
        }
        PendingSlot {
            seq,
            table: self,
            rx,
        }
    }

    /// Deliver a reply. Returns false if nobody is waiting on `seq`.
    pub fn complete(&self, seq: i32, reply: Message) -> bool {
        let slot = self.slots.lock().remove(&seq);
        match slot {
            Some(tx) => {
                // The waiter may have been cancelled in the meantime.
                let _ = tx.send(Ok(reply));
                true
            }
            None => false,
        }
    }

    /// Fail every outstanding request and empty the table.
    pub fn fail_all(&self, error: ClientError) {
        let slots: Vec<_> = self.slots.lock().drain().collect();
        for (_, tx) in slots {
            let _ = tx.send(Err(error.clone()));
        }
    }

    pub fn remove(&self, seq: i32) {
        self.slots.lock().remove(&seq);
    }

    pub fn len(&self) -> usize {
        self.slots.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Handle for one outstanding request.
pub struct PendingSlot<'a> {
    seq: i32,
    table: &'a PendingRequests,
    rx: oneshot::Receiver<Result<Message, ClientError>>,
}

impl PendingSlot<'_> {
    pub fn seq(&self) -> i32 {
        self.seq
    }

    /// Wait for the reply. A slot dropped without an answer counts as a
    /// lost connection.
    pub async fn wait(&mut self) -> Result<Message, ClientError> {
        match (&mut self.rx).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::ConnectionLost),
        }
    }
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        self.table.remove(self.seq);
    }
}

// Single-slot feedback mailbox: the newest snapshot replaces any unread one

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};

use crate::error::{ArmError, Result};
use crate::messages::Feedback;

/// What the reader thread posts: a decoded snapshot or the reason a line was rejected
type Slot = std::result::Result<Feedback, String>;

#[derive(Debug, Clone)]
pub struct FeedbackMailbox {
    tx: Sender<Slot>,
    rx: Receiver<Slot>,
}

impl Default for FeedbackMailbox {
    fn default() -> Self {
        Self::new()
    }
}

impl FeedbackMailbox {
    pub fn new() -> Self {
        let (tx, rx) = bounded(1);
        Self { tx, rx }
    }

    /// Replace the slot contents with a decoded snapshot
    pub fn post(&self, feedback: Feedback) {
        self.put(Ok(feedback));
    }

    /// Replace the slot contents with a decode failure
    pub fn post_malformed(&self, reason: String) {
        self.put(Err(reason));
    }

    fn put(&self, mut item: Slot) {
        loop {
            match self.tx.try_send(item) {
                Ok(()) => return,
                Err(TrySendError::Full(back)) => {
                    // Drop the stale entry; a concurrent taker may beat us to it
                    let _ = self.rx.try_recv();
                    item = back;
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }

    /// Block up to `timeout` for the next item
    pub fn wait(&self, timeout: Duration) -> Result<Feedback> {
        match self.rx.recv_timeout(timeout) {
            Ok(Ok(feedback)) => Ok(feedback),
            Ok(Err(reason)) => Err(ArmError::Protocol(reason)),
            Err(RecvTimeoutError::Timeout) => Err(ArmError::Timeout(timeout)),
            Err(RecvTimeoutError::Disconnected) => {
                Err(ArmError::Transport("feedback mailbox closed".to_string()))
            }
        }
    }

    /// Take whatever is waiting without blocking
    pub fn take(&self) -> Option<Result<Feedback>> {
        self.rx
            .try_recv()
            .ok()
            .map(|slot| slot.map_err(ArmError::Protocol))
    }

    /// Discard an unread item so the next wait sees only fresh feedback
    pub fn clear(&self) {
        while self.rx.try_recv().is_ok() {}
    }
}

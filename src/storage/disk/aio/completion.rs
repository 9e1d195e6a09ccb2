//! # Completion Routing
//!
//! Two ready-made [`CompletionHandler`]s for the handler pool:
//!
//! - [`CompletionTracker`] hands out `message1` tokens and a
//!   `tokio::sync::oneshot` receiver per token, so async code can `.await` a
//!   single request.
//! - [`ChannelCompletionHandler`] forwards every completion into a crossbeam
//!   channel for a synchronous consumer.
//!
//! ```text
//!   caller                       CompletionTracker                 handler thread
//!   ──────                       ─────────────────                 ──────────────
//!   register() ──────────────►   pending[token] = tx
//!     ◄── (token, rx)
//!   submit(message1 = token)
//!                                                   ◄───────────── on_complete(seg, c)
//!                                pending.remove(c.message1)
//!                                tx.send(c) ──────────────────────►
//!   rx.await ◄── Completion
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use crossbeam_channel::Sender;
use log::warn;
use parking_lot::Mutex;
use tokio::sync::oneshot;

use crate::common::config::{Message, SegmentId};
use crate::storage::disk::aio::handler::CompletionHandler;
use crate::storage::disk::aio::slot::Completion;

#[derive(Debug)]
pub struct CompletionTracker {
    next_token: AtomicU64,
    pending: Mutex<HashMap<Message, oneshot::Sender<Completion>>>,
}

impl Default for CompletionTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl CompletionTracker {
    pub fn new() -> Self {
        Self {
            next_token: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Reserves a fresh `message1` token. The receiver resolves when a
    /// completion carrying that token is routed through the tracker.
    pub fn register(&self) -> (Message, oneshot::Receiver<Completion>) {
        let token = self.next_token.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(token, tx);
        (token, rx)
    }

    /// Drops a registration whose request was never submitted.
    pub fn cancel(&self, token: Message) -> bool {
        self.pending.lock().remove(&token).is_some()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}

impl CompletionHandler for CompletionTracker {
    fn on_complete(&self, segment: SegmentId, completion: Completion) {
        let waiter = self.pending.lock().remove(&completion.message1);
        match waiter {
            Some(tx) => {
                // The receiver may have been dropped; nothing left to notify.
                let _ = tx.send(completion);
            }
            None => warn!(
                "segment {}: completion for unregistered message {}",
                segment, completion.message1
            ),
        }
    }
}

/// Forwards `(segment, completion)` pairs into a channel.
#[derive(Debug, Clone)]
pub struct ChannelCompletionHandler {
    sender: Sender<(SegmentId, Completion)>,
}

impl ChannelCompletionHandler {
    pub fn new(sender: Sender<(SegmentId, Completion)>) -> Self {
        Self { sender }
    }
}

impl CompletionHandler for ChannelCompletionHandler {
    fn on_complete(&self, segment: SegmentId, completion: Completion) {
        if self.sender.send((segment, completion)).is_err() {
            warn!("segment {}: completion receiver dropped", segment);
        }
    }
}

//! Pairing replies with the calls waiting for them.
//!
//! Every request carries a fresh correlation id (see [`get_correlation_id`]); every reply
//! copies it. Replies are matched strictly by that id, never by arrival order.
//!
//! Two bookkeeping structures live here, one per scheduling model:
//! - [`PendingRequests`], for cooperative callers: a table of oneshot senders resolved by
//!   the task forwarding replies, awaited by the task that issued the call;
//! - [`ReplyMultiplexer`], for blocking callers sharing a single reply queue: one caller at
//!   a time pumps the queue and files other callers' replies in their slot, waking them up.
use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::warn;
use uuid::Uuid;

/// A statistically unique, opaque token to tag an outbound request with.
pub fn get_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// A reply taken off the wire.
#[derive(Debug)]
pub struct Reply {
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
}

/// The calls of a cooperative client still waiting for their reply.
///
/// Entries are inserted by the task issuing the call and resolved by the task forwarding
/// replies. An entry is removed as soon as its reply arrives or its caller stops waiting,
/// whichever comes first - a late reply finds no entry and is discarded.
#[derive(Default, Debug)]
pub struct PendingRequests {
    entries: Mutex<HashMap<String, oneshot::Sender<Vec<u8>>>>,
}

impl PendingRequests {
    /// Start waiting for the reply tagged with `correlation_id`.
    pub fn register(self: &Arc<Self>, correlation_id: String) -> PendingReply {
        let (sender, receiver) = oneshot::channel();
        self.entries().insert(correlation_id.clone(), sender);
        PendingReply {
            table: Arc::clone(self),
            correlation_id,
            receiver,
        }
    }

    /// Hand `body` to the call waiting for `correlation_id`.
    ///
    /// Returns `false` if nobody is waiting for it (anymore).
    pub fn resolve(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        match self.entries().remove(correlation_id) {
            Some(sender) => sender.send(body).is_ok(),
            None => false,
        }
    }

    /// Route a reply to its caller, discarding it with a warning if nobody claims it.
    pub fn dispatch(&self, reply: Reply) {
        match reply.correlation_id.as_deref() {
            Some(id) => {
                if !self.resolve(id, reply.body) {
                    warn!(correlation_id = id, "Discarding a reply nobody is waiting for");
                }
            }
            None => warn!("Discarding a reply without correlation id"),
        }
    }

    /// How many calls are still waiting.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn forget(&self, correlation_id: &str) {
        self.entries().remove(correlation_id);
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, oneshot::Sender<Vec<u8>>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// A call registered in [`PendingRequests`].
///
/// Dropping it - after a reply, a timeout, or because the calling future was cancelled -
/// removes the entry from the table.
#[derive(Debug)]
pub struct PendingReply {
    table: Arc<PendingRequests>,
    correlation_id: String,
    receiver: oneshot::Receiver<Vec<u8>>,
}

impl PendingReply {
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Wait for the reply. `None` if `timeout` elapses first.
    pub async fn wait(mut self, timeout: Duration) -> Option<Vec<u8>> {
        tokio::time::timeout(timeout, &mut self.receiver)
            .await
            .ok()?
            .ok()
    }
}

impl Drop for PendingReply {
    fn drop(&mut self) {
        self.table.forget(&self.correlation_id);
    }
}

/// A source of replies that can be polled with a bounded wait.
pub trait ReplySource {
    type Error;

    /// Wait up to `wait` for the next reply. `Ok(None)` if none arrived in time.
    fn next_reply(&mut self, wait: Duration) -> Result<Option<Reply>, Self::Error>;
}

/// How long a waiter sleeps before checking again whether the reply source is free.
const HANDOVER_POLL: Duration = Duration::from_millis(25);

/// Multiplexes a single [`ReplySource`] across blocking callers.
///
/// Only one caller pumps the source at any time. While pumping, it files replies meant for
/// other callers in their slot and wakes them up. When it stops pumping (its own reply
/// arrived, or its deadline passed) another waiting caller takes over.
///
/// Replies are therefore serialized through one consumer: this bounds throughput, calls
/// issued faster than they are answered queue up behind it.
pub struct ReplyMultiplexer<S> {
    source: Mutex<S>,
    slots: Mutex<HashMap<String, Option<Vec<u8>>>>,
    filed: Condvar,
}

impl<S: ReplySource> ReplyMultiplexer<S> {
    pub fn new(source: S) -> Self {
        Self {
            source: Mutex::new(source),
            slots: Mutex::new(HashMap::new()),
            filed: Condvar::new(),
        }
    }

    /// Reserve a slot for `correlation_id`.
    ///
    /// Must be called *before* the request is published, or its reply might be discarded.
    pub fn register(&self, correlation_id: &str) {
        self.slots().insert(correlation_id.to_owned(), None);
    }

    /// Release the slot for `correlation_id` without waiting.
    pub fn forget(&self, correlation_id: &str) {
        self.slots().remove(correlation_id);
    }

    /// Block until the reply tagged with `correlation_id` arrives or `timeout` elapses.
    ///
    /// The slot is released in both cases.
    pub fn wait_for(
        &self,
        correlation_id: &str,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>, S::Error> {
        let deadline = Instant::now() + timeout;
        let outcome = self.wait_until(correlation_id, deadline);
        self.forget(correlation_id);
        outcome
    }

    fn wait_until(
        &self,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, S::Error> {
        loop {
            if let Some(body) = self.take(correlation_id) {
                return Ok(Some(body));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let mut source = match self.source.try_lock() {
                Ok(source) => source,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                Err(TryLockError::WouldBlock) => {
                    self.wait_for_filing(correlation_id, remaining.min(HANDOVER_POLL));
                    continue;
                }
            };
            let outcome = self.pump(&mut source, correlation_id, deadline);
            drop(source);
            // Let the next waiter take over the source.
            self.filed.notify_all();
            return outcome;
        }
    }

    fn pump(
        &self,
        source: &mut S,
        correlation_id: &str,
        deadline: Instant,
    ) -> Result<Option<Vec<u8>>, S::Error> {
        loop {
            if let Some(body) = self.take(correlation_id) {
                return Ok(Some(body));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let Some(reply) = source.next_reply(remaining)? else {
                continue;
            };
            match reply.correlation_id.as_deref() {
                Some(id) if id == correlation_id => return Ok(Some(reply.body)),
                Some(id) => {
                    if !self.file(id, reply.body) {
                        warn!(correlation_id = id, "Discarding a reply nobody is waiting for");
                    }
                }
                None => warn!("Discarding a reply without correlation id"),
            }
        }
    }

    fn file(&self, correlation_id: &str, body: Vec<u8>) -> bool {
        let mut slots = self.slots();
        match slots.get_mut(correlation_id) {
            Some(slot) => {
                *slot = Some(body);
                drop(slots);
                self.filed.notify_all();
                true
            }
            None => false,
        }
    }

    fn take(&self, correlation_id: &str) -> Option<Vec<u8>> {
        self.slots().get_mut(correlation_id).and_then(Option::take)
    }

    fn wait_for_filing(&self, correlation_id: &str, wait: Duration) {
        let slots = self.slots();
        if matches!(slots.get(correlation_id), Some(Some(_))) {
            return;
        }
        let _ = self.filed.wait_timeout(slots, wait);
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<String, Option<Vec<u8>>>> {
        self.slots.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

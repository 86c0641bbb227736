//! Single-slot mutex for per-message utility operations.
//!
//! Speech playback, translation, and source retrieval share one slot: at
//! most one of them is in progress at any time. Re-invoking the running
//! operation toggles it off; starting the same kind on another message
//! replaces the holder; a different kind is rejected while busy.

use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use parley_core::events::ChatEvent;
use parley_core::types::UtilityToken;

use crate::error::ChatError;

#[derive(Debug, Default)]
struct Slot {
    holder: Option<Holder>,
    next_generation: u64,
}

#[derive(Debug)]
struct Holder {
    token: UtilityToken,
    generation: u64,
    cancel: CancellationToken,
}

/// Outcome of [`UtilityMutex::acquire`].
#[derive(Debug)]
pub enum Acquire {
    Acquired(UtilityGuard),
    /// The identical operation was running and has been stopped.
    ToggledOff,
    /// A different kind of operation holds the slot.
    Busy(UtilityToken),
}

/// Outcome of [`UtilityMutex::run`].
#[derive(Debug, PartialEq)]
pub enum UtilityOutcome<T> {
    Completed(T),
    /// Cancelled while running, by a toggle or a replacing operation.
    Stopped,
    /// The call itself stopped the running operation.
    ToggledOff,
}

/// The slot shared by all utility operations.
#[derive(Debug)]
pub struct UtilityMutex {
    slot: Mutex<Slot>,
    events: Option<broadcast::Sender<ChatEvent>>,
}

impl UtilityMutex {
    pub fn new(events: Option<broadcast::Sender<ChatEvent>>) -> Self {
        Self {
            slot: Mutex::new(Slot::default()),
            events,
        }
    }

    /// Token currently holding the slot.
    pub fn current(&self) -> Option<UtilityToken> {
        self.lock().holder.as_ref().map(|h| h.token.clone())
    }

    pub fn is_active(&self, token: &UtilityToken) -> bool {
        self.lock()
            .holder
            .as_ref()
            .is_some_and(|h| &h.token == token)
    }

    /// Occupy the slot if it is empty or held by the same kind; a same-kind
    /// holder is cancelled and replaced.
    ///
    /// Beginning with the token that already holds the slot toggles it off:
    /// the holder is cancelled, the slot cleared, and `false` returned.
    pub fn begin(&self, token: &UtilityToken) -> bool {
        let mut slot = self.lock();
        if slot.holder.as_ref().is_some_and(|h| &h.token == token) {
            if let Some(holder) = slot.holder.take() {
                holder.cancel.cancel();
            }
            drop(slot);
            info!(utility = %token, "Utility toggled off");
            self.publish(None);
            return false;
        }
        drop(slot);
        self.occupy(token).is_some()
    }

    /// Clear the slot regardless of who holds it. The holder is cancelled.
    pub fn end(&self) {
        let mut slot = self.lock();
        if let Some(holder) = slot.holder.take() {
            holder.cancel.cancel();
            drop(slot);
            self.publish(None);
        }
    }

    /// Claim the slot with toggle semantics.
    pub fn acquire(self: &Arc<Self>, token: UtilityToken) -> Acquire {
        let mut slot = self.lock();
        if let Some(holder) = &slot.holder {
            if holder.token == token {
                holder.cancel.cancel();
                slot.holder = None;
                drop(slot);
                info!(utility = %token, "Utility toggled off");
                self.publish(None);
                return Acquire::ToggledOff;
            }
            if holder.token.kind != token.kind {
                return Acquire::Busy(holder.token.clone());
            }
        }
        drop(slot);

        match self.occupy(&token) {
            Some((generation, cancel)) => Acquire::Acquired(UtilityGuard {
                mutex: Arc::clone(self),
                generation,
                cancel,
            }),
            // A different kind took the slot between the check and the claim.
            None => match self.current() {
                Some(current) => Acquire::Busy(current),
                None => Acquire::Busy(token),
            },
        }
    }

    /// Run `body` while holding the slot.
    ///
    /// The body receives a cancellation token that fires when the operation
    /// is toggled off or replaced; the slot is released on every exit path.
    pub async fn run<F, Fut, T>(
        self: &Arc<Self>,
        token: UtilityToken,
        body: F,
    ) -> Result<UtilityOutcome<T>, ChatError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = Result<T, ChatError>>,
    {
        let guard = match self.acquire(token) {
            Acquire::Acquired(guard) => guard,
            Acquire::ToggledOff => return Ok(UtilityOutcome::ToggledOff),
            Acquire::Busy(current) => return Err(ChatError::UtilityBusy(current.to_string())),
        };
        let cancel = guard.cancel_token();
        let work = body(cancel.clone());
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Ok(UtilityOutcome::Stopped),
            result = work => result.map(UtilityOutcome::Completed),
        }
    }

    fn occupy(&self, token: &UtilityToken) -> Option<(u64, CancellationToken)> {
        let mut slot = self.lock();
        if let Some(holder) = &slot.holder {
            if holder.token.kind != token.kind {
                return None;
            }
            debug!(replaced = %holder.token, by = %token, "Replacing utility holder");
            holder.cancel.cancel();
        }
        slot.next_generation += 1;
        let generation = slot.next_generation;
        let cancel = CancellationToken::new();
        slot.holder = Some(Holder {
            token: token.clone(),
            generation,
            cancel: cancel.clone(),
        });
        drop(slot);
        self.publish(Some(token.clone()));
        Some((generation, cancel))
    }

    fn release(&self, generation: u64) {
        let mut slot = self.lock();
        let owns = slot
            .holder
            .as_ref()
            .is_some_and(|h| h.generation == generation);
        if owns {
            slot.holder = None;
            drop(slot);
            self.publish(None);
        }
    }

    // Recovers from poisoning: the slot is a plain value with no invariant
    // a panicking holder could break.
    fn lock(&self) -> MutexGuard<'_, Slot> {
        self.slot
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, token: Option<UtilityToken>) {
        if let Some(events) = &self.events {
            let _ = events.send(ChatEvent::UtilityChanged { token });
        }
    }
}

impl Default for UtilityMutex {
    fn default() -> Self {
        Self::new(None)
    }
}

/// Holds the slot until dropped.
#[derive(Debug)]
pub struct UtilityGuard {
    mutex: Arc<UtilityMutex>,
    generation: u64,
    cancel: CancellationToken,
}

impl UtilityGuard {
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for UtilityGuard {
    fn drop(&mut self) {
        self.mutex.release(self.generation);
    }
}

//! Cooperative cancellation slot
//!
//! A loader holds one [`AbortSlot`]. At most one operation is pending at a
//! time; `abort()` cancels it and frees the slot immediately, so a following
//! `load()` can start while the cancelled future is still unwinding.

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

/// Token for one pending operation
#[derive(Debug, Clone)]
pub struct AbortTicket {
    generation: u64,
    token: CancellationToken,
}

impl AbortTicket {
    /// Token to pass into cancellable work
    #[inline]
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether this operation has been cancelled
    #[inline]
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }
}

#[derive(Debug, Default)]
struct SlotState {
    generation: u64,
    pending: Option<AbortTicket>,
}

/// Single pending-operation slot with cancellation
#[derive(Debug, Default)]
pub struct AbortSlot {
    inner: Mutex<SlotState>,
}

impl AbortSlot {
    /// Create an empty slot
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot. Returns `None` while another operation is pending.
    pub fn try_begin(&self) -> Option<AbortTicket> {
        let mut state = self.inner.lock();
        if state.pending.is_some() {
            return None;
        }
        state.generation += 1;
        let ticket = AbortTicket {
            generation: state.generation,
            token: CancellationToken::new(),
        };
        state.pending = Some(ticket.clone());
        Some(ticket)
    }

    /// Claim the slot, cancelling whatever was pending
    pub fn begin(&self) -> AbortTicket {
        let mut state = self.inner.lock();
        if let Some(previous) = state.pending.take() {
            previous.token.cancel();
        }
        state.generation += 1;
        let ticket = AbortTicket {
            generation: state.generation,
            token: CancellationToken::new(),
        };
        state.pending = Some(ticket.clone());
        ticket
    }

    /// Release the slot if `ticket` still owns it.
    ///
    /// Returns `false` when the operation was aborted or superseded; its
    /// result must then be discarded.
    pub fn finish(&self, ticket: &AbortTicket) -> bool {
        let mut state = self.inner.lock();
        let owns = state
            .pending
            .as_ref()
            .is_some_and(|p| p.generation == ticket.generation);
        if owns {
            state.pending = None;
        }
        owns && !ticket.token.is_cancelled()
    }

    /// Cancel the pending operation. Returns whether anything was cancelled.
    pub fn abort(&self) -> bool {
        match self.inner.lock().pending.take() {
            Some(ticket) if !ticket.token.is_cancelled() => {
                ticket.token.cancel();
                true
            }
            _ => false,
        }
    }

    /// Whether an operation currently owns the slot
    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.inner.lock().pending.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_without_pending_is_false() {
        let slot = AbortSlot::new();
        assert!(!slot.abort());
    }

    #[test]
    fn abort_cancels_and_frees_slot() {
        let slot = AbortSlot::new();
        let ticket = slot.try_begin().unwrap();
        assert!(slot.is_pending());

        assert!(slot.abort());
        assert!(ticket.is_cancelled());
        assert!(!slot.is_pending());
        assert!(!slot.finish(&ticket));
        assert!(!slot.abort());
    }

    #[test]
    fn try_begin_refuses_while_pending() {
        let slot = AbortSlot::new();
        let first = slot.try_begin().unwrap();
        assert!(slot.try_begin().is_none());
        assert!(slot.finish(&first));
        assert!(slot.try_begin().is_some());
    }

    #[test]
    fn begin_supersedes_previous() {
        let slot = AbortSlot::new();
        let first = slot.begin();
        let second = slot.begin();

        assert!(first.is_cancelled());
        assert!(!slot.finish(&first));
        assert!(slot.is_pending());
        assert!(slot.finish(&second));
    }
}

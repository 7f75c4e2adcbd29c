//! Socket event dispatcher.
//!
//! A single mutex-guarded FIFO of socket events shared between socket
//! workers (producers) and the event loop (consumer). Each `send` posts
//! one drain wake to the loop; the loop pops exactly one event per wake,
//! so delivery order between events with the same (source, handler) pair
//! matches production order.
//!
//! Handlers and sockets may be destroyed while their events are still
//! queued; the bulk purge and retarget operations exist so owners can
//! clean up in-flight events before releasing storage.

use std::collections::VecDeque;

use parking_lot::Mutex;

use super::{HandlerId, LoopHandle, SourceId};
use crate::socket::SocketEvent;

/// Mutex-guarded FIFO of socket events bound to one event loop.
pub struct SocketEventDispatcher {
    pending: Mutex<VecDeque<SocketEvent>>,
    handle: LoopHandle,
}

impl SocketEventDispatcher {
    pub(crate) fn new(handle: LoopHandle) -> SocketEventDispatcher {
        SocketEventDispatcher {
            pending: Mutex::new(VecDeque::new()),
            handle,
        }
    }

    /// Queue an event and wake the loop to drain it.
    pub fn send(&self, event: SocketEvent) {
        self.pending.lock().push_back(event);
        self.handle.drain_socket_wake();
    }

    /// Drop all queued events targeting a dying handler.
    pub fn remove_pending_handler(&self, handler: HandlerId) {
        self.pending.lock().retain(|event| event.handler != handler);
    }

    /// Drop all queued events from a dying source.
    pub fn remove_pending_source(&self, source: SourceId) {
        self.pending.lock().retain(|event| event.source != source);
    }

    /// Retarget queued events, used when swapping the observer of a live
    /// socket.
    pub fn update_pending(
        &self,
        old_handler: HandlerId,
        old_source: SourceId,
        new_handler: HandlerId,
        new_source: SourceId,
    ) {
        for event in self.pending.lock().iter_mut() {
            if event.handler == old_handler && event.source == old_source {
                event.handler = new_handler;
                event.source = new_source;
            }
        }
    }

    /// Pop the oldest queued event. Called by the loop, once per wake.
    pub(crate) fn pop_front(&self) -> Option<SocketEvent> {
        self.pending.lock().pop_front()
    }

    #[cfg(test)]
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().len()
    }
}

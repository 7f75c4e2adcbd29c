//! Serial event loop with typed events and timers.
//!
//! All handler callbacks run on the thread driving [`EventLoop`] (the
//! controller thread) and are strictly serialized: a handler is never
//! re-entered while it is already running. Worker threads communicate with
//! the loop through a [`LoopHandle`], which is cheap to clone and `Send`.
//!
//! Socket events take a separate path: workers append them to the
//! [`SocketEventDispatcher`] FIFO and post a drain wake; the loop pops one
//! queued socket event per wake so that ordering between events with the
//! same (source, handler) pair is preserved and pending events can be
//! purged or retargeted while in flight.

pub mod dispatcher;

pub use dispatcher::SocketEventDispatcher;

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::socket::SocketEvent;

/// Identifies a registered event handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(u64);

/// Identifies an event source (one per socket).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl SourceId {
    /// Allocate a fresh, process-unique source id.
    pub fn next() -> SourceId {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        SourceId(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

/// Identifies a registered timer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimerId(u64);

/// A typed event delivered to a handler.
#[derive(Debug)]
pub enum Event {
    /// A timer registered by this handler fired.
    Timer(TimerId),
    /// A socket event from the dispatcher.
    Socket(SocketEvent),
    /// A cache lock this handler was queued on may now be available.
    ObtainLock,
}

/// Receives events from the loop.
pub trait EventHandler {
    /// Handle one event. Must not block; suspend by returning and waiting
    /// for the next event instead.
    fn handle_event(&mut self, event: Event);
}

enum Posted {
    Event { target: HandlerId, event: Event },
    DrainSocket,
    Recheck,
}

struct TimerEntry {
    id: TimerId,
    handler: HandlerId,
    deadline: Instant,
    interval: Duration,
    one_shot: bool,
}

#[derive(Default)]
struct TimerTable {
    next_id: u64,
    entries: Vec<TimerEntry>,
}

impl TimerTable {
    fn next_deadline(&self) -> Option<Instant> {
        self.entries.iter().map(|entry| entry.deadline).min()
    }

    /// Pop one due timer, re-arming it if periodic.
    fn take_due(&mut self, now: Instant) -> Option<(TimerId, HandlerId)> {
        let idx = self
            .entries
            .iter()
            .enumerate()
            .filter(|(_, entry)| entry.deadline <= now)
            .min_by_key(|(_, entry)| entry.deadline)
            .map(|(idx, _)| idx)?;
        if self.entries[idx].one_shot {
            let entry = self.entries.swap_remove(idx);
            Some((entry.id, entry.handler))
        } else {
            let entry = &mut self.entries[idx];
            entry.deadline += entry.interval;
            // Never schedule into the past after a stall.
            if entry.deadline <= now {
                entry.deadline = now + entry.interval;
            }
            Some((entry.id, entry.handler))
        }
    }
}

/// Cloneable, `Send` handle for posting events and managing timers from
/// any thread.
#[derive(Clone)]
pub struct LoopHandle {
    tx: Sender<Posted>,
    timers: Arc<Mutex<TimerTable>>,
}

impl LoopHandle {
    /// Post an event to a handler.
    pub fn post(&self, target: HandlerId, event: Event) {
        let _ = self.tx.send(Posted::Event { target, event });
    }

    /// Register a timer for `handler`. Periodic timers fire repeatedly
    /// every `interval` until stopped; one-shot timers fire once.
    pub fn add_timer(&self, handler: HandlerId, interval: Duration, one_shot: bool) -> TimerId {
        let id = {
            let mut timers = self.timers.lock();
            timers.next_id += 1;
            let id = TimerId(timers.next_id);
            timers.entries.push(TimerEntry {
                id,
                handler,
                deadline: Instant::now() + interval,
                interval,
                one_shot,
            });
            id
        };
        // Wake the loop in case the new deadline is the earliest.
        let _ = self.tx.send(Posted::Recheck);
        id
    }

    /// Cancel a timer. Stopping an already-fired one-shot timer is a no-op.
    pub fn stop_timer(&self, id: TimerId) {
        self.timers.lock().entries.retain(|entry| entry.id != id);
    }

    fn drain_socket_wake(&self) {
        let _ = self.tx.send(Posted::DrainSocket);
    }
}

/// The controller-thread event loop.
pub struct EventLoop {
    rx: Receiver<Posted>,
    handle: LoopHandle,
    dispatcher: Arc<SocketEventDispatcher>,
    handlers: HashMap<HandlerId, Rc<RefCell<dyn EventHandler>>>,
    next_handler: u64,
}

impl EventLoop {
    /// Create a new event loop together with its socket event dispatcher.
    pub fn new() -> EventLoop {
        let (tx, rx) = mpsc::channel();
        let handle = LoopHandle {
            tx,
            timers: Arc::new(Mutex::new(TimerTable::default())),
        };
        let dispatcher = Arc::new(SocketEventDispatcher::new(handle.clone()));
        EventLoop {
            rx,
            handle,
            dispatcher,
            handlers: HashMap::new(),
            next_handler: 0,
        }
    }

    /// A handle for posting events and timers from any thread.
    pub fn handle(&self) -> LoopHandle {
        self.handle.clone()
    }

    /// The socket event dispatcher attached to this loop.
    pub fn dispatcher(&self) -> Arc<SocketEventDispatcher> {
        self.dispatcher.clone()
    }

    /// Reserve a handler id before the handler object exists. Sockets and
    /// timers can be created against the id; install the handler with
    /// [`EventLoop::install_handler`] before events start flowing.
    pub fn allocate_handler(&mut self) -> HandlerId {
        self.next_handler += 1;
        HandlerId(self.next_handler)
    }

    /// Install the handler object behind a previously allocated id.
    pub fn install_handler(&mut self, id: HandlerId, handler: Rc<RefCell<dyn EventHandler>>) {
        self.handlers.insert(id, handler);
    }

    /// Register a handler in one step.
    pub fn register(&mut self, handler: Rc<RefCell<dyn EventHandler>>) -> HandlerId {
        let id = self.allocate_handler();
        self.install_handler(id, handler);
        id
    }

    /// Remove a handler: drops its pending socket events and timers. Must
    /// be called before the handler's storage is released.
    pub fn remove_handler(&mut self, id: HandlerId) {
        self.handlers.remove(&id);
        self.dispatcher.remove_pending_handler(id);
        self.handle.timers.lock().entries.retain(|entry| entry.handler != id);
    }

    /// Wait up to `timeout` for one event (posted, socket or timer) and
    /// deliver it. Returns whether an event was delivered.
    pub fn run_one(&mut self, timeout: Duration) -> bool {
        let limit = Instant::now() + timeout;
        loop {
            if self.fire_due_timer() {
                return true;
            }

            let now = Instant::now();
            if now >= limit {
                return false;
            }
            let deadline = self
                .handle
                .timers
                .lock()
                .next_deadline()
                .map_or(limit, |d| d.min(limit));
            let wait = deadline.saturating_duration_since(now);

            match self.rx.recv_timeout(wait) {
                Ok(Posted::Event { target, event }) => {
                    self.deliver(target, event);
                    return true;
                }
                Ok(Posted::DrainSocket) => {
                    if let Some(event) = self.dispatcher.pop_front() {
                        let target = event.handler;
                        self.deliver(target, Event::Socket(event));
                        return true;
                    }
                }
                Ok(Posted::Recheck) => {}
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Deliver all immediately available events without blocking.
    pub fn run_until_idle(&mut self) -> usize {
        let mut delivered = 0;
        loop {
            if self.fire_due_timer() {
                delivered += 1;
                continue;
            }
            match self.rx.try_recv() {
                Ok(Posted::Event { target, event }) => {
                    self.deliver(target, event);
                    delivered += 1;
                }
                Ok(Posted::DrainSocket) => {
                    if let Some(event) = self.dispatcher.pop_front() {
                        let target = event.handler;
                        self.deliver(target, Event::Socket(event));
                        delivered += 1;
                    }
                }
                Ok(Posted::Recheck) => {}
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => return delivered,
            }
        }
    }

    fn fire_due_timer(&mut self) -> bool {
        let due = self.handle.timers.lock().take_due(Instant::now());
        match due {
            Some((timer, handler)) => {
                self.deliver(handler, Event::Timer(timer));
                true
            }
            None => false,
        }
    }

    fn deliver(&mut self, target: HandlerId, event: Event) {
        let Some(handler) = self.handlers.get(&target).cloned() else {
            tracing::debug!(handler = ?target, "dropping event for unregistered handler");
            return;
        };
        handler.borrow_mut().handle_event(event);
    }
}

impl Default for EventLoop {
    fn default() -> Self {
        Self::new()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::SocketEventKind;
    use std::time::Duration;

    struct Recorder {
        events: Vec<String>,
    }

    impl EventHandler for Recorder {
        fn handle_event(&mut self, event: Event) {
            self.events.push(match event {
                Event::Timer(_) => "timer".into(),
                Event::Socket(ev) => format!("socket:{:?}", ev.kind),
                Event::ObtainLock => "obtain_lock".into(),
            });
        }
    }

    fn recorder() -> Rc<RefCell<Recorder>> {
        Rc::new(RefCell::new(Recorder { events: Vec::new() }))
    }

    #[test]
    fn posted_events_are_delivered_in_order() {
        let mut el = EventLoop::new();
        let rec = recorder();
        let id = el.register(rec.clone());

        el.handle().post(id, Event::ObtainLock);
        el.handle().post(id, Event::ObtainLock);
        assert_eq!(el.run_until_idle(), 2);
        assert_eq!(rec.borrow().events, vec!["obtain_lock", "obtain_lock"]);
    }

    #[test]
    fn events_for_unregistered_handlers_are_dropped() {
        let mut el = EventLoop::new();
        let rec = recorder();
        let id = el.register(rec.clone());
        el.remove_handler(id);

        el.handle().post(id, Event::ObtainLock);
        el.run_until_idle();
        assert!(rec.borrow().events.is_empty());
    }

    #[test]
    fn one_shot_timer_fires_once() {
        let mut el = EventLoop::new();
        let rec = recorder();
        let id = el.register(rec.clone());

        el.handle().add_timer(id, Duration::from_millis(5), true);
        assert!(el.run_one(Duration::from_millis(500)));
        assert!(!el.run_one(Duration::from_millis(20)));
        assert_eq!(rec.borrow().events, vec!["timer"]);
    }

    #[test]
    fn periodic_timer_keeps_firing_until_stopped() {
        let mut el = EventLoop::new();
        let rec = recorder();
        let id = el.register(rec.clone());

        let timer = el.handle().add_timer(id, Duration::from_millis(5), false);
        assert!(el.run_one(Duration::from_millis(500)));
        assert!(el.run_one(Duration::from_millis(500)));
        el.handle().stop_timer(timer);
        assert!(!el.run_one(Duration::from_millis(20)));
        assert_eq!(rec.borrow().events.len(), 2);
    }

    #[test]
    fn socket_events_pop_one_per_wake() {
        let mut el = EventLoop::new();
        let rec = recorder();
        let id = el.register(rec.clone());
        let dispatcher = el.dispatcher();
        let source = SourceId::next();

        dispatcher.send(SocketEvent::new(source, id, SocketEventKind::Write(crate::SysError::NONE)));
        dispatcher.send(SocketEvent::new(source, id, SocketEventKind::Read(crate::SysError::NONE)));

        assert!(el.run_one(Duration::from_millis(100)));
        assert_eq!(rec.borrow().events.len(), 1);
        assert!(rec.borrow().events[0].starts_with("socket:Write"));
        assert!(el.run_one(Duration::from_millis(100)));
        assert!(rec.borrow().events[1].starts_with("socket:Read"));
    }
}

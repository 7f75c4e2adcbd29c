//! Process-wide advisory cache locks.
//!
//! Multiple control sockets connected to the same server coordinate
//! cache access through one [`CacheLockManager`] owned by the engine and
//! handed to each socket at construction. Entries are kept in insertion
//! order; a request is granted iff no earlier entry shares its
//! (server, directory, reason) key, which gives strict FIFO fairness
//! between concurrent requesters of the same key.
//!
//! Owners are identified by an integer [`LockOwner`] id plus the owner's
//! handler id for wake-ups; the manager never holds references into a
//! control socket.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use skiff_core::event::{Event, HandlerId, LoopHandle};

use crate::path::RemotePath;
use crate::server::ServerKey;

/// What the cache is being locked for. Two holders with different
/// reasons do not conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockReason {
    /// Retrieving or mutating a directory listing.
    List,
    /// Creating directories.
    Mkdir,
}

/// Stable identity of a lock-holding control socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LockOwner(u64);

impl LockOwner {
    /// Allocate a fresh, process-unique owner id.
    pub fn next() -> LockOwner {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        LockOwner(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug)]
struct LockEntry {
    owner: LockOwner,
    handler: HandlerId,
    server: ServerKey,
    directory: RemotePath,
    reason: LockReason,
    waiting: bool,
    lockcount: u32,
}

impl LockEntry {
    fn same_key(&self, server: &ServerKey, directory: &RemotePath, reason: LockReason) -> bool {
        self.server == *server && self.directory == *directory && self.reason == reason
    }
}

/// Outcome of a lock request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockRequest {
    /// The lock is held; proceed.
    Granted,
    /// Queued behind an earlier holder; park until an obtain-lock event
    /// arrives.
    Waiting,
}

struct ManagerInner {
    entries: Vec<LockEntry>,
    handle: LoopHandle,
}

/// The engine-owned lock list. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct CacheLockManager {
    inner: Arc<Mutex<ManagerInner>>,
}

impl CacheLockManager {
    /// Create the manager. Obtain-lock wake-ups are posted through
    /// `handle` to the waiting socket's handler.
    pub fn new(handle: LoopHandle) -> CacheLockManager {
        CacheLockManager {
            inner: Arc::new(Mutex::new(ManagerInner { entries: Vec::new(), handle })),
        }
    }

    /// Request the lock for (server, directory, reason). Re-entrant for
    /// an owner that already holds it: `op_already_holds` tells the
    /// manager whether the current operation record accounted for its
    /// hold yet, so the count is bumped at most once per record.
    pub fn try_lock(
        &self,
        owner: LockOwner,
        handler: HandlerId,
        server: &ServerKey,
        directory: &RemotePath,
        reason: LockReason,
        op_already_holds: bool,
    ) -> LockRequest {
        let mut inner = self.inner.lock();

        let own_idx = match inner.entries.iter().position(|entry| entry.owner == owner) {
            Some(idx) => {
                let entry = &mut inner.entries[idx];
                if entry.lockcount > 0 {
                    if !op_already_holds {
                        entry.lockcount += 1;
                    }
                    return LockRequest::Granted;
                }
                debug_assert!(entry.waiting);
                debug_assert_eq!(entry.reason, reason);
                idx
            }
            None => {
                inner.entries.push(LockEntry {
                    owner,
                    handler,
                    server: server.clone(),
                    directory: directory.clone(),
                    reason,
                    waiting: true,
                    lockcount: 0,
                });
                inner.entries.len() - 1
            }
        };

        // An earlier entry with the same key holds or is next in line.
        if inner.entries[..own_idx]
            .iter()
            .any(|entry| entry.same_key(server, directory, reason))
        {
            return LockRequest::Waiting;
        }

        let entry = &mut inner.entries[own_idx];
        entry.waiting = false;
        entry.lockcount = 1;
        LockRequest::Granted
    }

    /// Drop one hold. Removing the entry (last hold released, or a wait
    /// abandoned) wakes the first remaining same-keyed entry.
    pub fn unlock(&self, owner: LockOwner) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.entries.iter().position(|entry| entry.owner == owner) else {
            return;
        };

        if !inner.entries[idx].waiting {
            let entry = &mut inner.entries[idx];
            entry.lockcount = entry.lockcount.saturating_sub(1);
            if entry.lockcount > 0 {
                return;
            }
        }

        let removed = inner.entries.remove(idx);
        Self::notify_next(&mut inner, &removed.server, &removed.directory, removed.reason);
    }

    /// Remove whatever this owner has, granted or waiting. Called on
    /// socket teardown so no entry outlives its socket.
    pub fn release_all_for(&self, owner: LockOwner) {
        let mut inner = self.inner.lock();
        let Some(idx) = inner.entries.iter().position(|entry| entry.owner == owner) else {
            return;
        };
        let removed = inner.entries.remove(idx);
        Self::notify_next(&mut inner, &removed.server, &removed.directory, removed.reason);
    }

    /// React to an obtain-lock event: grant if this owner's entry is now
    /// the earliest of its key, otherwise keep waiting (it lost the race).
    pub fn obtain_from_event(&self, owner: LockOwner) -> Option<LockReason> {
        let mut inner = self.inner.lock();
        let own_idx = inner.entries.iter().position(|entry| entry.owner == owner)?;
        if !inner.entries[own_idx].waiting {
            return None;
        }

        let (server, directory, reason) = {
            let entry = &inner.entries[own_idx];
            (entry.server.clone(), entry.directory.clone(), entry.reason)
        };
        if inner.entries[..own_idx]
            .iter()
            .any(|entry| entry.same_key(&server, &directory, reason))
        {
            return None;
        }

        let entry = &mut inner.entries[own_idx];
        entry.waiting = false;
        entry.lockcount += 1;
        Some(entry.reason)
    }

    /// Whether this owner is queued on a lock (watchdog suppression).
    pub fn is_waiting(&self, owner: LockOwner) -> bool {
        self.inner
            .lock()
            .entries
            .iter()
            .any(|entry| entry.owner == owner && entry.waiting)
    }

    /// Whether this owner holds or waits on anything.
    pub fn owns_entry(&self, owner: LockOwner) -> bool {
        self.inner.lock().entries.iter().any(|entry| entry.owner == owner)
    }

    /// Granted lock count for one key, for invariant checks.
    pub fn granted_count(&self, server: &ServerKey, directory: &RemotePath, reason: LockReason) -> usize {
        self.inner
            .lock()
            .entries
            .iter()
            .filter(|entry| entry.same_key(server, directory, reason) && !entry.waiting)
            .count()
    }

    fn notify_next(inner: &mut ManagerInner, server: &ServerKey, directory: &RemotePath, reason: LockReason) {
        if let Some(next) = inner
            .entries
            .iter()
            .find(|entry| entry.same_key(server, directory, reason))
        {
            inner.handle.post(next.handler, Event::ObtainLock);
        }
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use skiff_core::event::EventLoop;

    use crate::server::ServerDescriptor;
    use crate::server::ServerKind;

    struct Fixture {
        el: EventLoop,
        manager: CacheLockManager,
        server: ServerKey,
        dir: RemotePath,
    }

    fn fixture() -> Fixture {
        let el = EventLoop::new();
        let manager = CacheLockManager::new(el.handle());
        Fixture {
            el,
            manager,
            server: ServerDescriptor::new("ftp.example.com", 21).key(),
            dir: RemotePath::parse(ServerKind::Ftp, "/pub").unwrap(),
        }
    }

    fn requester(el: &mut EventLoop) -> (LockOwner, HandlerId) {
        (LockOwner::next(), el.allocate_handler())
    }

    #[test]
    fn first_requester_is_granted() {
        let mut fx = fixture();
        let (owner, handler) = requester(&mut fx.el);
        let res = fx
            .manager
            .try_lock(owner, handler, &fx.server, &fx.dir, LockReason::List, false);
        assert_eq!(res, LockRequest::Granted);
        assert_eq!(fx.manager.granted_count(&fx.server, &fx.dir, LockReason::List), 1);
    }

    #[test]
    fn same_key_waits_different_reason_does_not() {
        let mut fx = fixture();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);

        assert_eq!(
            fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Granted
        );
        assert_eq!(
            fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Waiting
        );
        // A different reason on the same directory is independent.
        let (c, hc) = requester(&mut fx.el);
        assert_eq!(
            fx.manager.try_lock(c, hc, &fx.server, &fx.dir, LockReason::Mkdir, false),
            LockRequest::Granted
        );
    }

    #[test]
    fn reentrant_lock_bumps_once_per_record() {
        let mut fx = fixture();
        let (owner, handler) = requester(&mut fx.el);

        assert_eq!(
            fx.manager.try_lock(owner, handler, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Granted
        );
        // Same record asking again: no extra hold.
        assert_eq!(
            fx.manager.try_lock(owner, handler, &fx.server, &fx.dir, LockReason::List, true),
            LockRequest::Granted
        );
        // A pushed sub-record takes its own hold.
        assert_eq!(
            fx.manager.try_lock(owner, handler, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Granted
        );

        fx.manager.unlock(owner);
        assert!(fx.manager.owns_entry(owner));
        fx.manager.unlock(owner);
        assert!(!fx.manager.owns_entry(owner));
    }

    #[test]
    fn fifo_grant_order_with_cancellation() {
        let mut fx = fixture();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);
        let (c, hc) = requester(&mut fx.el);

        assert_eq!(
            fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Granted
        );
        assert_eq!(
            fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Waiting
        );
        assert_eq!(
            fx.manager.try_lock(c, hc, &fx.server, &fx.dir, LockReason::List, false),
            LockRequest::Waiting
        );

        // A releases; B is first in line.
        fx.manager.unlock(a);
        assert_eq!(fx.manager.obtain_from_event(b), Some(LockReason::List));
        // C came later and must keep waiting.
        assert_eq!(fx.manager.obtain_from_event(c), None);

        // B releases its grant; C is next.
        fx.manager.unlock(b);
        assert_eq!(fx.manager.obtain_from_event(c), Some(LockReason::List));
    }

    #[test]
    fn cancelled_waiter_passes_the_wake_along() {
        let mut fx = fixture();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);
        let (c, hc) = requester(&mut fx.el);

        fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(c, hc, &fx.server, &fx.dir, LockReason::List, false);

        // A releases, then B abandons its wait before reacting.
        fx.manager.unlock(a);
        fx.manager.unlock(b);

        // The stale event reaching B is harmless...
        assert_eq!(fx.manager.obtain_from_event(b), None);
        // ...and C can be granted.
        assert_eq!(fx.manager.obtain_from_event(c), Some(LockReason::List));
    }

    #[test]
    fn granted_locks_are_exclusive_per_key() {
        let mut fx = fixture();
        let other_dir = RemotePath::parse(ServerKind::Ftp, "/other").unwrap();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);
        let (c, hc) = requester(&mut fx.el);

        fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(c, hc, &fx.server, &other_dir, LockReason::List, false);

        assert_eq!(fx.manager.granted_count(&fx.server, &fx.dir, LockReason::List), 1);
        assert_eq!(fx.manager.granted_count(&fx.server, &other_dir, LockReason::List), 1);
    }

    #[test]
    fn release_all_wakes_successors() {
        let mut fx = fixture();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);

        fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false);

        // Socket A dies with the lock held.
        fx.manager.release_all_for(a);
        assert!(!fx.manager.owns_entry(a));
        assert_eq!(fx.manager.obtain_from_event(b), Some(LockReason::List));
    }

    #[test]
    fn is_waiting_tracks_queue_state() {
        let mut fx = fixture();
        let (a, ha) = requester(&mut fx.el);
        let (b, hb) = requester(&mut fx.el);

        fx.manager.try_lock(a, ha, &fx.server, &fx.dir, LockReason::List, false);
        fx.manager.try_lock(b, hb, &fx.server, &fx.dir, LockReason::List, false);
        assert!(!fx.manager.is_waiting(a));
        assert!(fx.manager.is_waiting(b));

        fx.manager.unlock(a);
        fx.manager.obtain_from_event(b);
        assert!(!fx.manager.is_waiting(b));
    }
}

//! Lock fairness across concurrent control sockets, with obtain-lock
//! wake-ups flowing through the event loop.

use std::cell::RefCell;
use std::rc::Rc;

use skiff_core::event::{Event, EventHandler};
use skiff_engine::{Command, ControlSocket, LockReason, OpData, RemotePath, ReplyCode, ServerDescriptor, ServerKind};
use skiff_test_utils::{CountingDialect, EngineFixture};

/// A control socket installed as a loop handler without a real socket.
struct BaseSession {
    ctl: ControlSocket,
    dialect: CountingDialect,
}

impl BaseSession {
    fn reset(&mut self, code: ReplyCode) {
        self.ctl.reset_operation(&mut self.dialect, code);
    }
}

impl EventHandler for BaseSession {
    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Timer(timer) => self.ctl.on_timer(&mut self.dialect, timer),
            Event::ObtainLock => self.ctl.on_obtain_lock(&mut self.dialect),
            Event::Socket(_) => {}
        }
    }
}

fn server() -> ServerDescriptor {
    ServerDescriptor::new("ftp.example.com", 21).with_user("demo", "demo")
}

fn list_dir() -> RemotePath {
    RemotePath::parse(ServerKind::Ftp, "/shared").unwrap()
}

fn session(fx: &mut EngineFixture) -> Rc<RefCell<BaseSession>> {
    let mut ctl = fx.control_socket(Default::default());
    ctl.attach_server(server());
    ctl.start_op(Box::new(OpData::new(Command::List)));
    let handler = ctl.handler();
    let session = Rc::new(RefCell::new(BaseSession { ctl, dialect: CountingDialect::default() }));
    fx.el.install_handler(handler, session.clone());
    session
}

#[test]
fn grant_order_follows_insertion_order() {
    let mut fx = EngineFixture::new();
    let a = session(&mut fx);
    let b = session(&mut fx);
    let c = session(&mut fx);

    assert!(a.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));
    assert!(!b.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));
    assert!(!c.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));

    // A finishes; the wake must reach B, not C.
    a.borrow_mut().reset(ReplyCode::OK);
    fx.el.run_until_idle();
    assert_eq!(b.borrow().dialect.send_next, 1);
    assert_eq!(c.borrow().dialect.send_next, 0);
    assert!(!b.borrow().ctl.is_waiting_for_lock());
    assert!(c.borrow().ctl.is_waiting_for_lock());

    // B finishes; now C.
    b.borrow_mut().reset(ReplyCode::OK);
    fx.el.run_until_idle();
    assert_eq!(c.borrow().dialect.send_next, 1);
    assert!(!c.borrow().ctl.is_waiting_for_lock());
}

#[test]
fn cancelled_waiter_is_skipped() {
    let mut fx = EngineFixture::new();
    let a = session(&mut fx);
    let b = session(&mut fx);
    let c = session(&mut fx);

    assert!(a.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));
    assert!(!b.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));
    assert!(!c.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));

    // A finishes, but B cancels before its wake is processed.
    a.borrow_mut().reset(ReplyCode::OK);
    b.borrow_mut().reset(ReplyCode::CANCELED);

    fx.el.run_until_idle();
    // The stale wake for B is harmless; C got the lock.
    assert_eq!(b.borrow().dialect.send_next, 0);
    assert_eq!(c.borrow().dialect.send_next, 1);
    assert!(!c.borrow().ctl.is_waiting_for_lock());
}

#[test]
fn granted_set_stays_exclusive_per_key() {
    let mut fx = EngineFixture::new();
    let a = session(&mut fx);
    let b = session(&mut fx);

    let dir = list_dir();
    assert!(a.borrow_mut().ctl.try_lock_cache(LockReason::List, &dir));
    assert!(!b.borrow_mut().ctl.try_lock_cache(LockReason::List, &dir));

    let key = server().key();
    assert_eq!(fx.locks.granted_count(&key, &dir, LockReason::List), 1);

    // Mkdir on the same directory is a different key.
    let m = session(&mut fx);
    assert!(m.borrow_mut().ctl.try_lock_cache(LockReason::Mkdir, &dir));
    assert_eq!(fx.locks.granted_count(&key, &dir, LockReason::Mkdir), 1);
    assert_eq!(fx.locks.granted_count(&key, &dir, LockReason::List), 1);
}

#[test]
fn dropping_a_socket_releases_its_entry() {
    let mut fx = EngineFixture::new();
    let a = session(&mut fx);
    let b = session(&mut fx);

    assert!(a.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));
    assert!(!b.borrow_mut().ctl.try_lock_cache(LockReason::List, &list_dir()));

    let a_handler = a.borrow().ctl.handler();
    fx.el.remove_handler(a_handler);
    drop(a);

    fx.el.run_until_idle();
    assert_eq!(b.borrow().dialect.send_next, 1);
}

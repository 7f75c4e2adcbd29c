//! End-to-end behavior of the real control socket over loopback.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;

use skiff_core::socket::{AddressFamily, Socket, SocketState};
use skiff_engine::{
    Command, EngineOptions, OpData, RealControlSocket, ReplyCode, ServerDescriptor, Session,
};
use skiff_test_utils::{CountingDialect, EngineFixture, RecordingSink};

type TestSession = Rc<RefCell<Session<CountingDialect>>>;

struct Loopback {
    fx: EngineFixture,
    session: TestSession,
    listener: Socket,
    port: u16,
}

fn setup(options: EngineOptions) -> Loopback {
    let mut fx = EngineFixture::new();

    let mut listener = Socket::new(fx.el.dispatcher(), None);
    listener.listen(AddressFamily::Ipv4, 0).unwrap();
    let port = listener.local_port().unwrap();

    let ctl = fx.control_socket(options);
    let handler = ctl.handler();
    let real = RealControlSocket::new(ctl, fx.el.dispatcher());
    let session = Rc::new(RefCell::new(Session::new(real, CountingDialect::default())));
    fx.el.install_handler(handler, session.clone());

    Loopback { fx, session, listener, port }
}

fn run_until<F: Fn(&Loopback) -> bool>(lb: &mut Loopback, pred: F) -> bool {
    for _ in 0..200 {
        if pred(lb) {
            return true;
        }
        lb.fx.el.run_one(Duration::from_millis(50));
    }
    pred(lb)
}

fn connect(lb: &mut Loopback) -> ReplyCode {
    let server = ServerDescriptor::new("127.0.0.1", lb.port).with_user("demo", "demo");
    let mut guard = lb.session.borrow_mut();
    let session = &mut *guard;
    session.real.connect(&mut session.dialect, &server)
}

fn sink(lb: &Loopback) -> &RecordingSink {
    lb.fx.sink.as_ref()
}

#[test]
fn connect_logs_progress_and_reaches_connected() {
    let mut lb = setup(EngineOptions::default());
    assert_eq!(connect(&mut lb), ReplyCode::WOULD_BLOCK);

    assert!(run_until(&mut lb, |lb| {
        lb.session.borrow().real.socket().state() == SocketState::Connected
    }));
    assert!(sink(&lb).logged("Connecting to 127.0.0.1"));
    assert!(!lb.session.borrow().real.ctl().is_closed());
}

#[test]
fn bytes_sent_arrive_in_order() {
    let mut lb = setup(EngineOptions::default());
    connect(&mut lb);
    assert!(run_until(&mut lb, |lb| {
        lb.session.borrow().real.socket().state() == SocketState::Connected
    }));
    let mut peer = lb.listener.accept().unwrap();

    {
        let mut guard = lb.session.borrow_mut();
        let session = &mut *guard;
        assert!(session.real.send(&mut session.dialect, b"USER demo\r\n"));
        assert!(session.real.send(&mut session.dialect, b"PASS secret\r\n"));
    }

    let mut received = Vec::new();
    for _ in 0..200 {
        let mut buf = [0u8; 256];
        match peer.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => received.extend_from_slice(&buf[..n]),
            Err(err) if err.would_block() => {
                lb.fx.el.run_one(Duration::from_millis(20));
            }
            Err(err) => panic!("peer read failed: {}", err),
        }
        if received.len() >= 24 {
            break;
        }
    }
    assert_eq!(received, b"USER demo\r\nPASS secret\r\n");
}

#[test]
fn greeting_is_readable_after_connection() {
    let mut lb = setup(EngineOptions::default());
    connect(&mut lb);
    assert!(run_until(&mut lb, |lb| {
        lb.session.borrow().real.socket().state() == SocketState::Connected
    }));
    let mut peer = lb.listener.accept().unwrap();
    assert_eq!(peer.write(b"220 ready\r\n").unwrap(), 11);

    let mut collected = Vec::new();
    for _ in 0..200 {
        {
            let mut guard = lb.session.borrow_mut();
            let mut buf = [0u8; 64];
            loop {
                match guard.real.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => collected.extend_from_slice(&buf[..n]),
                    Err(_) => break,
                }
            }
        }
        if collected.len() >= 11 {
            break;
        }
        lb.fx.el.run_one(Duration::from_millis(20));
    }
    assert_eq!(collected, b"220 ready\r\n");
}

#[test]
fn peer_close_outside_connect_logs_and_resets() {
    let mut lb = setup(EngineOptions::default());
    connect(&mut lb);
    assert!(run_until(&mut lb, |lb| {
        lb.session.borrow().real.socket().state() == SocketState::Connected
    }));
    let mut peer = lb.listener.accept().unwrap();
    peer.close();

    assert!(run_until(&mut lb, |lb| lb.session.borrow().real.ctl().is_closed()));
    assert!(sink(&lb).logged("Connection closed by server"));
}

#[test]
fn idle_connection_times_out() {
    let mut lb = setup(EngineOptions::default().with_timeout_secs(1));
    connect(&mut lb);
    assert!(run_until(&mut lb, |lb| {
        lb.session.borrow().real.socket().state() == SocketState::Connected
    }));
    let _peer = lb.listener.accept().unwrap();

    // An operation is in flight, then the connection goes quiet.
    lb.session
        .borrow_mut()
        .real
        .ctl_mut()
        .start_op(Box::new(OpData::new(Command::List)));

    assert!(run_until(&mut lb, |lb| lb.fx.sink.logged("Connection timed out")));
    let completions = lb.fx.sink.completions();
    let (command, code) = completions.last().expect("operation completion");
    assert_eq!(*command, Command::List);
    assert!(code.contains(ReplyCode::TIMEOUT));
    assert!(code.contains(ReplyCode::DISCONNECTED));
    assert!(code.is_error());
    assert!(lb.session.borrow().real.ctl().is_closed());
}

#[test]
fn failed_connect_reports_attempt_failure() {
    let mut lb = setup(EngineOptions::default());
    // Close the listener so the connect is refused.
    lb.listener.close();

    assert_eq!(connect(&mut lb), ReplyCode::WOULD_BLOCK);
    assert!(run_until(&mut lb, |lb| lb.session.borrow().real.ctl().is_closed()));
    assert!(sink(&lb).logged("Connection attempt failed with"));
}

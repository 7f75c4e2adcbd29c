//! The real control socket.
//!
//! Glues a skiff-core [`Socket`] and its byte-stream backend to the
//! control-socket base: send buffering, connect sequencing including the
//! proxy backend swap, and the close logging rules. Protocol dialects
//! never touch the socket directly; they send through
//! [`RealControlSocket::send`] and read through
//! [`RealControlSocket::read`] when a [`ControlEvent::Readable`] arrives.

use std::sync::Arc;

use bytes::{Buf, BytesMut};

use skiff_core::backend::{DirectBackend, RateLimiter, SocketBackend, Unlimited};
use skiff_core::error::SysError;
use skiff_core::event::{Event, EventHandler, SocketEventDispatcher, TimerId};
use skiff_core::socket::{AddressFamily, Socket, SocketEvent, SocketEventKind};

use crate::command::Command;
use crate::control::ops::OpPayload;
use crate::control::{ControlSocket, Dialect};
use crate::reply::ReplyCode;
use crate::server::{EncodingPreference, ServerDescriptor};

/// A backend that tunnels the connection through a proxy (or TLS) and
/// performs its own handshake by consuming the socket's events. Once the
/// tunnel is usable it posts a synthetic `Connection` event to the
/// observer, after which the control socket detaches it.
pub trait ProxyBackend: SocketBackend {
    /// Start the handshake toward `host:port`. Returning `Ok` means "in
    /// progress"; completion is the synthetic connection event.
    fn handshake(
        &mut self,
        socket: &mut Socket,
        host: &str,
        port: u16,
        user: &str,
        pass: &str,
    ) -> Result<(), SysError>;
}

enum Backend {
    Direct(DirectBackend),
    Proxy(Box<dyn ProxyBackend>),
}

impl Backend {
    fn read(&mut self, socket: &mut Socket, buf: &mut [u8]) -> Result<usize, SysError> {
        match self {
            Backend::Direct(backend) => backend.read(socket, buf),
            Backend::Proxy(backend) => backend.read(socket, buf),
        }
    }

    fn write(&mut self, socket: &mut Socket, buf: &[u8]) -> Result<usize, SysError> {
        match self {
            Backend::Direct(backend) => backend.write(socket, buf),
            Backend::Proxy(backend) => backend.write(socket, buf),
        }
    }
}

/// What a socket event meant for the protocol layer above.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlEvent {
    /// Nothing the dialect needs to act on.
    None,
    /// The connection (including any proxy tunnel) is usable; greet.
    Connected,
    /// Bytes are waiting; read until would-block.
    Readable,
    /// The pending send buffer drained.
    WriteReady,
    /// The connection ended; the operation was reset.
    Closed,
}

/// Control socket bound to a real TCP connection.
pub struct RealControlSocket {
    ctl: ControlSocket,
    socket: Socket,
    backend: Backend,
    pending_proxy: Option<Box<dyn ProxyBackend>>,
    send_buffer: BytesMut,
    limiter: Arc<dyn RateLimiter>,
}

impl RealControlSocket {
    pub fn new(ctl: ControlSocket, dispatcher: Arc<SocketEventDispatcher>) -> RealControlSocket {
        RealControlSocket::with_rate_limiter(ctl, dispatcher, Arc::new(Unlimited))
    }

    pub fn with_rate_limiter(
        ctl: ControlSocket,
        dispatcher: Arc<SocketEventDispatcher>,
        limiter: Arc<dyn RateLimiter>,
    ) -> RealControlSocket {
        let socket = Socket::new(dispatcher, Some(ctl.handler()));
        RealControlSocket {
            ctl,
            socket,
            backend: Backend::Direct(DirectBackend::new(limiter.clone())),
            pending_proxy: None,
            send_buffer: BytesMut::new(),
            limiter,
        }
    }

    pub fn ctl(&self) -> &ControlSocket {
        &self.ctl
    }

    pub fn ctl_mut(&mut self) -> &mut ControlSocket {
        &mut self.ctl
    }

    pub fn socket(&self) -> &Socket {
        &self.socket
    }

    /// Install the proxy backend the next connect should tunnel through.
    pub fn set_proxy_backend(&mut self, proxy: Box<dyn ProxyBackend>) {
        self.pending_proxy = Some(proxy);
    }

    /// Bytes still queued for the peer.
    pub fn pending_send_len(&self) -> usize {
        self.send_buffer.len()
    }

    // =========================================================================
    // Connect sequencing
    // =========================================================================

    /// Open the control connection to `server`.
    pub fn connect(&mut self, dialect: &mut dyn Dialect, server: &ServerDescriptor) -> ReplyCode {
        self.ctl.set_wait(true);

        if let EncodingPreference::Custom(label) = &server.encoding {
            tracing::debug!(encoding = label.as_str(), "using custom encoding");
        }

        let mut stored = server.clone();
        stored.host = self.ctl.convert_domain_name(&server.host);
        self.ctl.attach_server(stored);

        self.continue_connect(dialect)
    }

    /// Pick the endpoint (server, per-op override, or proxy) and start
    /// the socket connect. Success and "in progress" are treated alike;
    /// the connection event decides.
    pub fn continue_connect(&mut self, dialect: &mut dyn Dialect) -> ReplyCode {
        let Some(server) = self.ctl.server().cloned() else {
            tracing::warn!("continue_connect without a current server");
            self.ctl.reset_operation(dialect, ReplyCode::INTERNAL_ERROR);
            return ReplyCode::ERROR;
        };

        let proxy = self.ctl.options().proxy.clone();
        let (host, port) = if proxy.enabled() && !server.bypass_proxy {
            self.ctl
                .log_status(format!("Connecting to {} through proxy", server.format_host()));

            match self.pending_proxy.take() {
                Some(mut backend) => {
                    match backend.handshake(&mut self.socket, &server.host, server.port, &proxy.user, &proxy.pass)
                    {
                        Ok(()) => self.backend = Backend::Proxy(backend),
                        Err(err) => {
                            self.ctl
                                .log_error(format!("Could not start proxy handshake: {}", err));
                            self.do_close(dialect, ReplyCode::DISCONNECTED);
                            return ReplyCode::ERROR;
                        }
                    }
                }
                None => {
                    self.ctl.log_error(format!(
                        "Could not start proxy handshake: {}",
                        SysError(libc::EPROTONOSUPPORT)
                    ));
                    self.do_close(dialect, ReplyCode::DISCONNECTED);
                    return ReplyCode::ERROR;
                }
            }
            (proxy.host, proxy.port)
        } else {
            let from_op = self.ctl.current_op().and_then(|op| match &op.payload {
                OpPayload::Connect(data) if !data.host.is_empty() => {
                    Some((self.ctl.convert_domain_name(&data.host), data.port))
                }
                _ => None,
            });
            from_op.unwrap_or((server.host.clone(), server.port))
        };

        if host.parse::<std::net::IpAddr>().is_err() {
            self.ctl.log_status(format!("Resolving address of {}", host));
        }

        match self.socket.connect(&host, port, AddressFamily::Unspec) {
            Ok(()) => ReplyCode::WOULD_BLOCK,
            Err(err) => {
                self.ctl.log_error(format!("Could not connect to server: {}", err));
                self.do_close(dialect, ReplyCode::DISCONNECTED);
                ReplyCode::ERROR
            }
        }
    }

    // =========================================================================
    // Byte stream
    // =========================================================================

    /// Queue bytes for the peer: direct write first, residue buffered for
    /// the next write-ready event. Any error other than would-block is
    /// fatal for the connection. Returns whether the connection survives.
    pub fn send(&mut self, dialect: &mut dyn Dialect, buffer: &[u8]) -> bool {
        self.ctl.set_wait(true);

        if !self.send_buffer.is_empty() {
            self.send_buffer.extend_from_slice(buffer);
            return true;
        }

        let written = match self.backend.write(&mut self.socket, buffer) {
            Ok(written) => written,
            Err(err) if err.would_block() => 0,
            Err(err) => {
                self.ctl.log_error(format!("Could not write to socket: {}", err));
                self.ctl.log_error("Disconnected from server".into());
                self.do_close(dialect, ReplyCode::DISCONNECTED);
                return false;
            }
        };

        if written > 0 {
            self.ctl.set_alive();
        }
        if written < buffer.len() {
            self.send_buffer.extend_from_slice(&buffer[written..]);
        }
        true
    }

    /// Read bytes from the backend. Every accepted byte restarts the
    /// timeout stopwatch.
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, SysError> {
        let n = self.backend.read(&mut self.socket, buf)?;
        if n > 0 {
            self.ctl.set_alive();
        }
        Ok(n)
    }

    /// Drain the pending send buffer after a write-ready event.
    fn on_write_ready(&mut self, dialect: &mut dyn Dialect) {
        while !self.send_buffer.is_empty() {
            let written = match self.backend.write(&mut self.socket, &self.send_buffer) {
                Ok(written) => written,
                Err(err) if err.would_block() => return,
                Err(err) => {
                    self.ctl.log_error(format!("Could not write to socket: {}", err));
                    if self.ctl.current_command() != Command::Connect {
                        self.ctl.log_error("Disconnected from server".into());
                    }
                    self.do_close(dialect, ReplyCode::DISCONNECTED);
                    return;
                }
            };
            if written == 0 {
                return;
            }
            self.ctl.set_alive();
            self.send_buffer.advance(written);
        }
    }

    // =========================================================================
    // Event handling
    // =========================================================================

    /// Route a loop event. The returned [`ControlEvent`] tells the
    /// dialect what, if anything, to do next.
    pub fn dispatch(&mut self, dialect: &mut dyn Dialect, event: Event) -> ControlEvent {
        match event {
            Event::Timer(timer) => {
                self.on_timer(dialect, timer);
                ControlEvent::None
            }
            Event::ObtainLock => {
                self.ctl.on_obtain_lock(dialect);
                ControlEvent::None
            }
            Event::Socket(event) => self.on_socket_event(dialect, event),
        }
    }

    /// Handle one socket event.
    pub fn on_socket_event(&mut self, dialect: &mut dyn Dialect, event: SocketEvent) -> ControlEvent {
        if event.source != self.socket.source_id() {
            tracing::debug!(source = ?event.source, "socket event from a stale source");
            return ControlEvent::None;
        }

        match event.kind {
            SocketEventKind::HostAddress(address) => {
                self.ctl.log_status(format!("Connecting to {}...", address));
                ControlEvent::None
            }
            SocketEventKind::ConnectionNext(err) => {
                if err.is_err() {
                    self.ctl.log_status(format!(
                        "Connection attempt failed with \"{}\", trying next address.",
                        err
                    ));
                }
                ControlEvent::None
            }
            SocketEventKind::Connection(err) if err.is_err() => {
                self.ctl
                    .log_status(format!("Connection attempt failed with \"{}\".", err));
                self.on_close(dialect, err);
                ControlEvent::Closed
            }
            SocketEventKind::Connection(_) => {
                // A completed proxy handshake hands the tunnel over to a
                // fresh direct backend on the same descriptor.
                if matches!(self.backend, Backend::Proxy(_)) {
                    if let Backend::Proxy(proxy) = &mut self.backend {
                        if !proxy.detached() {
                            proxy.detach();
                        }
                    }
                    self.backend = Backend::Direct(DirectBackend::new(self.limiter.clone()));
                }
                ControlEvent::Connected
            }
            SocketEventKind::Read(_) => ControlEvent::Readable,
            SocketEventKind::Write(_) => {
                self.on_write_ready(dialect);
                if self.ctl.is_closed() {
                    ControlEvent::Closed
                } else {
                    ControlEvent::WriteReady
                }
            }
            SocketEventKind::Close(err) => {
                self.on_close(dialect, err);
                ControlEvent::Closed
            }
        }
    }

    fn on_close(&mut self, dialect: &mut dyn Dialect, err: SysError) {
        tracing::debug!(?err, "control connection closed");
        // During connect the connection-attempt handler already logged.
        if self.ctl.current_command() != Command::Connect {
            if err.is_ok() {
                self.ctl.log_error("Connection closed by server".into());
            } else {
                self.ctl.log_error(format!("Disconnected from server: {}", err));
            }
        }
        self.do_close(dialect, ReplyCode::DISCONNECTED);
    }

    /// Watchdog tick.
    pub fn on_timer(&mut self, dialect: &mut dyn Dialect, timer: TimerId) {
        if !self.ctl.timer_matches(timer) {
            return;
        }
        if self.ctl.watchdog_expired() {
            self.ctl.log_error("Connection timed out".into());
            self.do_close(dialect, ReplyCode::TIMEOUT);
        }
    }

    /// Tear down socket and operation state.
    pub fn do_close(&mut self, dialect: &mut dyn Dialect, code: ReplyCode) -> ReplyCode {
        self.reset_socket();
        self.ctl.do_close(dialect, code)
    }

    /// Cancel the operation in flight.
    pub fn cancel(&mut self, dialect: &mut dyn Dialect) {
        match self.ctl.current_command() {
            Command::None => {}
            Command::Connect => {
                self.do_close(dialect, ReplyCode::CANCELED);
            }
            _ => {
                self.ctl.reset_operation(dialect, ReplyCode::CANCELED);
            }
        }
    }

    fn reset_socket(&mut self) {
        self.socket.close();
        self.send_buffer.clear();
        self.pending_proxy = None;
        self.backend = Backend::Direct(DirectBackend::new(self.limiter.clone()));
    }
}

/// A control socket paired with its dialect, ready to be installed as an
/// event-loop handler.
pub struct Session<D: Dialect> {
    pub real: RealControlSocket,
    pub dialect: D,
}

impl<D: Dialect> Session<D> {
    pub fn new(real: RealControlSocket, dialect: D) -> Session<D> {
        Session { real, dialect }
    }
}

impl<D: Dialect> EventHandler for Session<D> {
    fn handle_event(&mut self, event: Event) {
        self.real.dispatch(&mut self.dialect, event);
    }
}

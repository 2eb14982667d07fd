//! The event loop.
//!
//! One thread blocks in [`Poller::wait`] and classifies ready events: the
//! listener tag feeds the accept loop, the wake tag breaks the loop for
//! shutdown, and client tags dispatch read/write tasks to the worker pool.
//! Client descriptors are armed ONESHOT before dispatch, so at most one
//! worker ever touches a given connection; the worker re-arms the interest
//! set before finishing, which is the only way a subsequent event becomes
//! deliverable.

use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::os::unix::io::{IntoRawFd, RawFd};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;

use ktimer::Timer;
use poller::{Events, Interest, Poller};
use protocol_http::Request;
use socket2::{Domain, Protocol, Socket, Type};
use workpool::WorkerPool;

use crate::config::Config;
use crate::connection::{Connection, ConnectionTable};
use crate::handler::HandlerTable;
use crate::metrics;
use crate::writer::ResponseWriter;

/// Tag for the listening socket. Client tags are the descriptor itself, so
/// the reserved tags sit at the top of the u64 range.
const LISTENER_TAG: u64 = u64::MAX;

/// Tag for the shutdown eventfd.
const WAKE_TAG: u64 = u64::MAX - 1;

/// The HTTP server. [`Server::run`] blocks on the event loop until a
/// [`ShutdownHandle`] stops it.
pub struct Server {
    ctx: Arc<ServerCtx>,
    local_addr: SocketAddr,
}

/// Cloneable handle that stops a running server from another thread or a
/// signal handler.
#[derive(Clone)]
pub struct ShutdownHandle {
    ctx: Arc<ServerCtx>,
}

impl ShutdownHandle {
    pub fn stop(&self) {
        self.ctx.request_stop();
    }
}

struct ServerCtx {
    listen_fd: RawFd,
    wake_fd: RawFd,
    edge_clients: bool,
    edge_listener: bool,
    idle_timeout: Duration,
    segment_capacity: usize,
    poller: Poller,
    connections: ConnectionTable,
    handlers: RwLock<HandlerTable>,
    pool: WorkerPool,
    timer: Timer<RawFd>,
    running: AtomicBool,
    listener_closed: AtomicBool,
    /// Back-reference handed to timer callbacks, which outlive any one
    /// borrow of the context.
    self_handle: Weak<ServerCtx>,
}

impl Server {
    /// Bind, listen, and prepare the multiplexer, pool, and idle timer.
    /// Fatal errors here bubble up; the binary exits non-zero.
    pub fn new(config: &Config) -> io::Result<Server> {
        let address = config.listener.address;
        let socket = Socket::new(Domain::for_address(address), Type::STREAM, Some(Protocol::TCP))?;
        socket.set_reuse_address(true)?;
        socket.set_nonblocking(true)?;
        socket.bind(&address.into())?;
        socket.listen(config.listener.backlog as i32)?;
        let local_addr = socket
            .local_addr()?
            .as_socket()
            .ok_or_else(|| io::Error::other("listener has no socket address"))?;
        let listen_fd = socket.into_raw_fd();

        let wake_fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if wake_fd < 0 {
            let err = io::Error::last_os_error();
            unsafe {
                libc::close(listen_fd);
            }
            return Err(err);
        }

        let poller = Poller::with_min_capacity(config.poller.min_events)?;
        let mut listener_interest = Interest::READABLE | Interest::RDHUP;
        if config.listener.edge_triggered_listener {
            listener_interest |= Interest::EDGE;
        }
        poller.add(listen_fd, listener_interest, LISTENER_TAG)?;
        poller.add(wake_fd, Interest::READABLE, WAKE_TAG)?;

        let edge_clients = config.listener.edge_triggered;
        let edge_listener = config.listener.edge_triggered_listener;
        let idle_timeout = config.idle_timeout();
        let segment_capacity = config.connection.segment_size;
        let threads = config.threads();

        let ctx = Arc::new_cyclic(|weak| ServerCtx {
            listen_fd,
            wake_fd,
            edge_clients,
            edge_listener,
            idle_timeout,
            segment_capacity,
            poller,
            connections: ConnectionTable::new(),
            handlers: RwLock::new(HandlerTable::new()),
            pool: WorkerPool::new(threads),
            timer: Timer::new(),
            running: AtomicBool::new(false),
            listener_closed: AtomicBool::new(false),
            self_handle: weak.clone(),
        });

        Ok(Server { ctx, local_addr })
    }

    /// The bound address (useful when configured with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Register a handler pattern. Expected before [`Server::run`].
    pub fn register(
        &self,
        pattern: &str,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) -> bool {
        self.ctx.handlers.write().unwrap().register(pattern, handler)
    }

    /// Handler for targets no pattern matches.
    pub fn set_fallback(
        &self,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) {
        self.ctx.handlers.write().unwrap().set_fallback(handler)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            ctx: self.ctx.clone(),
        }
    }

    /// Run the event loop on the calling thread until stopped.
    pub fn run(&self) -> io::Result<()> {
        let ctx = &self.ctx;
        ctx.running.store(true, Ordering::Release);
        ctx.timer.start();
        tracing::info!(
            address = %self.local_addr,
            workers = ctx.pool.thread_count(),
            edge = ctx.edge_clients,
            "server started"
        );

        let mut events = Events::new();
        while ctx.running.load(Ordering::Acquire) {
            match ctx.poller.wait(None, &mut events) {
                Ok(_) => {}
                Err(e)
                    if matches!(
                        e.raw_os_error(),
                        Some(libc::EINTR) | Some(libc::ECONNABORTED)
                    ) =>
                {
                    continue;
                }
                Err(e) => {
                    tracing::error!(error = %e, "multiplexer wait failed");
                    break;
                }
            }

            for event in events.iter().copied() {
                match event.tag() {
                    LISTENER_TAG => ctx.accept_ready(),
                    WAKE_TAG => ctx.drain_wake(),
                    tag => {
                        let fd = tag as RawFd;
                        if event.is_error() || event.is_closed() {
                            let task_ctx = Arc::clone(ctx);
                            ctx.pool.submit(move || task_ctx.close_connection(fd));
                        } else if event.is_readable() {
                            let task_ctx = Arc::clone(ctx);
                            ctx.pool.submit(move || task_ctx.on_readable(fd));
                        } else if event.is_writable() {
                            let task_ctx = Arc::clone(ctx);
                            ctx.pool.submit(move || task_ctx.on_writable(fd));
                        }
                    }
                }
            }

            ctx.poller.resize();
        }

        self.shutdown();
        Ok(())
    }

    /// Orderly teardown: listener first, then timers, then the in-flight
    /// tasks, then every connection.
    fn shutdown(&self) {
        let ctx = &self.ctx;
        tracing::info!("shutting down");
        ctx.close_listener();
        ctx.timer.stop();
        ctx.timer.clear();
        ctx.pool.pause();
        ctx.pool.wait();
        ctx.connections.clear();
        // Let stale queued tasks run against the emptied table so they drop
        // their context references.
        ctx.pool.resume();
        ctx.pool.wait();
        metrics::CONNECTIONS_ACTIVE.set(0);
    }
}

impl ServerCtx {
    fn request_stop(&self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let one: u64 = 1;
        unsafe {
            libc::write(self.wake_fd, &one as *const u64 as *const libc::c_void, 8);
        }
    }

    fn close_listener(&self) {
        if self.listener_closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.poller.remove(self.listen_fd);
        unsafe {
            libc::close(self.listen_fd);
        }
    }

    fn client_interest(&self, ready: Interest) -> Interest {
        let mut interest = ready | Interest::ONESHOT | Interest::RDHUP;
        if self.edge_clients {
            interest |= Interest::EDGE;
        }
        interest
    }

    /// Accept pending connections: all of them in edge mode, one in level
    /// mode (the kernel will re-report).
    fn accept_ready(&self) {
        loop {
            let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
            let mut len = std::mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
            let fd = unsafe {
                libc::accept4(
                    self.listen_fd,
                    &mut storage as *mut _ as *mut libc::sockaddr,
                    &mut len,
                    libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                )
            };
            if fd < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(libc::EAGAIN) => break,
                    Some(libc::EINTR) | Some(libc::ECONNABORTED) => continue,
                    Some(libc::EMFILE) | Some(libc::ENFILE) => {
                        // Descriptor exhaustion: drop the connection attempt
                        // and keep serving the ones we have.
                        tracing::warn!(error = %err, "accept failed, descriptor limit reached");
                        break;
                    }
                    _ => {
                        if self.running.load(Ordering::Acquire) {
                            tracing::error!(error = %err, "accept failed");
                        }
                        break;
                    }
                }
            }

            let peer = sockaddr_to_socketaddr(&storage)
                .unwrap_or_else(|| SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0));
            metrics::CONNECTIONS_ACCEPTED.increment();
            metrics::CONNECTIONS_ACTIVE.increment();
            tracing::debug!(fd, %peer, "accepted connection");

            let conn = Connection::new(fd, peer, self.segment_capacity);
            if self.connections.insert(fd, conn).is_none() {
                // Dropping the refused connection closes the descriptor.
                tracing::error!(fd, "descriptor already tracked");
                metrics::CONNECTIONS_ACTIVE.decrement();
                continue;
            }
            self.arm_idle(fd);
            if let Err(e) = self
                .poller
                .add(fd, self.client_interest(Interest::READABLE), fd as u64)
            {
                tracing::error!(fd, error = %e, "failed to register client");
                self.timer.cancel(&fd);
                self.connections.close(fd);
                metrics::CONNECTIONS_ACTIVE.decrement();
                continue;
            }

            if !self.edge_listener {
                break;
            }
        }
    }

    fn drain_wake(&self) {
        let mut buf = [0u8; 8];
        loop {
            let n = unsafe {
                libc::read(self.wake_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len())
            };
            if n <= 0 {
                break;
            }
        }
    }

    /// Read task: drive the parser; dispatch a complete request to its
    /// handler and flip the interest to WRITE, or re-arm READ when the
    /// request is still incomplete.
    fn on_readable(&self, fd: RawFd) {
        let Some(conn) = self.connections.get(fd) else {
            return;
        };
        let mut guard = conn.lock().unwrap();
        if guard.is_closed() {
            return;
        }

        let (state, request) = guard.parse_from_fd(self.edge_clients);
        if state.is_error() {
            if guard.peer_closed() {
                tracing::debug!(fd, "peer closed mid-request");
            } else {
                metrics::PROTOCOL_ERRORS.increment();
                tracing::debug!(fd, ?state, "protocol error");
                fail_request(&mut guard, 400);
                let _ = guard.send();
            }
            drop(guard);
            self.close_connection(fd);
            return;
        }

        match request {
            Some(request) => {
                metrics::REQUESTS_RECEIVED.increment();
                let handler = self.handlers.read().unwrap().route(request.uri());
                match handler {
                    Some(handler) => {
                        let writer = guard.writer();
                        let outcome =
                            panic::catch_unwind(AssertUnwindSafe(|| handler(writer, &request)));
                        if outcome.is_err() {
                            metrics::HANDLER_PANICS.increment();
                            tracing::error!(fd, uri = request.uri(), "handler panicked");
                            fail_request(&mut guard, 500);
                        }
                    }
                    None => {
                        let writer = guard.writer();
                        writer.set_status(404);
                        writer.write("not found");
                    }
                }
                guard.assemble_response();
                drop(guard);
                self.touch_idle(fd);
                self.rearm(fd, Interest::WRITABLE);
            }
            None => {
                drop(guard);
                self.touch_idle(fd);
                self.rearm(fd, Interest::READABLE);
            }
        }
    }

    /// Write task: one vectored send; re-arm WRITE on residual, recycle or
    /// close on completion.
    fn on_writable(&self, fd: RawFd) {
        let Some(conn) = self.connections.get(fd) else {
            return;
        };
        let mut guard = conn.lock().unwrap();
        if guard.is_closed() {
            return;
        }

        match guard.send() {
            Ok(n) => {
                metrics::BYTES_SENT.add(n as u64);
                if guard.has_pending_write() {
                    drop(guard);
                    self.touch_idle(fd);
                    self.rearm(fd, Interest::WRITABLE);
                } else {
                    metrics::RESPONSES_SENT.increment();
                    if guard.keep_alive() {
                        guard.reset();
                        drop(guard);
                        self.touch_idle(fd);
                        self.rearm(fd, Interest::READABLE);
                    } else {
                        drop(guard);
                        self.close_connection(fd);
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                drop(guard);
                self.rearm(fd, Interest::WRITABLE);
            }
            Err(e) => {
                tracing::debug!(fd, error = %e, "send failed");
                drop(guard);
                self.close_connection(fd);
            }
        }
    }

    /// Re-arm the ONESHOT registration; a failure means the descriptor is
    /// gone and the connection is torn down.
    fn rearm(&self, fd: RawFd, ready: Interest) {
        if self
            .poller
            .modify(fd, self.client_interest(ready), fd as u64)
            .is_err()
        {
            self.close_connection(fd);
        }
    }

    fn arm_idle(&self, fd: RawFd) {
        let Some(ctx) = self.self_handle.upgrade() else {
            return;
        };
        self.timer.add(
            fd,
            move || {
                metrics::IDLE_TIMEOUTS.increment();
                tracing::debug!(fd, "idle timeout");
                ctx.close_connection(fd);
            },
            self.idle_timeout,
            1,
            Duration::ZERO,
        );
    }

    /// Activity bump: push the idle deadline out by rescheduling the
    /// fd-keyed timer entry.
    fn touch_idle(&self, fd: RawFd) {
        self.timer.cancel(&fd);
        self.arm_idle(fd);
    }

    /// Tear down one connection: timer entry, multiplexer registration, then
    /// the descriptor itself. Safe to call twice.
    fn close_connection(&self, fd: RawFd) {
        self.timer.cancel(&fd);
        let _ = self.poller.remove(fd);
        if self.connections.close(fd) {
            metrics::CONNECTIONS_ACTIVE.decrement();
            tracing::debug!(fd, "connection closed");
        }
    }
}

impl Drop for ServerCtx {
    fn drop(&mut self) {
        self.close_listener();
        unsafe {
            libc::close(self.wake_fd);
        }
    }
}

/// Write a 400/500-class response into the connection, replacing anything
/// the handler half-produced, and mark the connection for closing.
fn fail_request(conn: &mut Connection, status: u16) {
    let writer = conn.writer();
    writer.clear();
    writer.set_status(status);
    let reason = protocol_http::reason_phrase(status).unwrap_or("error");
    writer.write(reason);
    conn.set_keep_alive(false);
    conn.assemble_response();
}

fn sockaddr_to_socketaddr(storage: &libc::sockaddr_storage) -> Option<SocketAddr> {
    match storage.ss_family as libc::c_int {
        libc::AF_INET => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr));
            Some(SocketAddr::new(IpAddr::V4(ip), u16::from_be(sa.sin_port)))
        }
        libc::AF_INET6 => {
            let sa = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
            let ip = Ipv6Addr::from(sa.sin6_addr.s6_addr);
            Some(SocketAddr::new(IpAddr::V6(ip), u16::from_be(sa.sin6_port)))
        }
        _ => None,
    }
}

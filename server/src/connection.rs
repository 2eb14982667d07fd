//! Per-client connection state and the fd → connection table.

use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::os::unix::io::RawFd;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use bufvec::BufVec;
use protocol_http::{ParseState, Request, RequestParser};

use crate::writer::ResponseWriter;

/// Upper bound on iovecs handed to a single `writev`.
const MAX_IOVECS: usize = 64;

/// State for one client socket.
///
/// The parser and writer are built lazily on first use and torn down by
/// [`Connection::reset`] between keep-alive requests. No internal locking:
/// the ONESHOT arming discipline guarantees one task at a time, and the
/// table wraps each connection in a mutex to express that in the type
/// system.
pub struct Connection {
    fd: RawFd,
    peer: SocketAddr,
    segment_capacity: usize,
    parser: Option<RequestParser>,
    writer: Option<ResponseWriter>,
    /// Fully-assembled response bytes awaiting vectored send.
    outbound: BufVec,
    keep_alive: bool,
    last_activity: Instant,
}

impl Connection {
    pub fn new(fd: RawFd, peer: SocketAddr, segment_capacity: usize) -> Self {
        Connection {
            fd,
            peer,
            segment_capacity,
            parser: None,
            writer: None,
            outbound: BufVec::with_segment_capacity(segment_capacity),
            keep_alive: true,
            last_activity: Instant::now(),
        }
    }

    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn keep_alive(&self) -> bool {
        self.keep_alive
    }

    pub fn set_keep_alive(&mut self, keep_alive: bool) {
        self.keep_alive = keep_alive;
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn touch(&mut self) {
        self.last_activity = Instant::now();
    }

    /// Drive the parser over whatever the socket has to offer. A complete
    /// request updates the keep-alive flag.
    pub fn parse_from_fd(&mut self, edge_triggered: bool) -> (ParseState, Option<Request>) {
        let parser = self.parser.get_or_insert_with(RequestParser::new);
        let (state, request) = parser.consume_from_fd(self.fd, edge_triggered);
        if let Some(request) = &request {
            self.keep_alive = request.is_keep_alive();
        }
        self.touch();
        (state, request)
    }

    /// Whether the last drain observed the peer closing its end.
    pub fn peer_closed(&self) -> bool {
        self.parser.as_ref().is_some_and(|p| p.peer_closed())
    }

    /// The response writer for the current request, created on demand.
    pub fn writer(&mut self) -> &mut ResponseWriter {
        let capacity = self.segment_capacity;
        self.writer
            .get_or_insert_with(|| ResponseWriter::with_segment_capacity(capacity))
    }

    /// Materialize the outbound bytes: status line, header block, then the
    /// body segments spliced in without copying.
    pub fn assemble_response(&mut self) {
        let keep_alive = self.keep_alive;
        if let Some(writer) = self.writer.as_mut() {
            writer.serialize_into(keep_alive, &mut self.outbound);
        }
    }

    pub fn has_pending_write(&self) -> bool {
        self.outbound.readable_len() > 0
    }

    pub fn pending_bytes(&self) -> usize {
        self.outbound.readable_len()
    }

    /// One vectored write of the pending outbound bytes. Returns the number
    /// of bytes accepted by the kernel; the residual stays queued.
    pub fn send(&mut self) -> io::Result<usize> {
        let iovecs = self.outbound.readable_iovecs();
        if iovecs.is_empty() {
            return Ok(0);
        }
        let count = iovecs.len().min(MAX_IOVECS);
        let n = unsafe { libc::writev(self.fd, iovecs.as_ptr(), count as libc::c_int) };
        if n < 0 {
            return Err(io::Error::last_os_error());
        }
        self.outbound.consume(n as usize);
        self.touch();
        Ok(n as usize)
    }

    /// Clear parser, writer, and outbound state for the next request on a
    /// keep-alive connection. The descriptor and peer address survive.
    pub fn reset(&mut self) {
        if let Some(parser) = self.parser.as_mut() {
            parser.clear();
        }
        self.writer = None;
        self.outbound.clear();
        self.touch();
    }

    /// Close the descriptor. Idempotent.
    pub fn close(&mut self) -> bool {
        if self.fd < 0 {
            return false;
        }
        unsafe {
            libc::close(self.fd);
        }
        self.fd = -1;
        true
    }

    pub fn is_closed(&self) -> bool {
        self.fd < 0
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.close();
    }
}

/// fd → connection ownership, shared between the event loop, the workers,
/// and the idle timer.
///
/// Lookups take the read lock and clone the `Arc`; insertion and removal
/// take the write lock briefly. The per-connection mutex is uncontended by
/// construction (ONESHOT serializes work per descriptor) but makes the
/// exclusivity explicit.
#[derive(Default)]
pub struct ConnectionTable {
    map: RwLock<HashMap<RawFd, Arc<Mutex<Connection>>>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a connection; refuses a descriptor that is already present.
    /// Returns a shared reference to the inserted connection.
    pub fn insert(&self, fd: RawFd, conn: Connection) -> Option<Arc<Mutex<Connection>>> {
        let mut map = self.map.write().unwrap();
        if map.contains_key(&fd) {
            return None;
        }
        let conn = Arc::new(Mutex::new(conn));
        map.insert(fd, conn.clone());
        Some(conn)
    }

    pub fn get(&self, fd: RawFd) -> Option<Arc<Mutex<Connection>>> {
        self.map.read().unwrap().get(&fd).cloned()
    }

    /// Close and remove a connection. Returns false when the descriptor is
    /// not present (already closed).
    pub fn close(&self, fd: RawFd) -> bool {
        let removed = self.map.write().unwrap().remove(&fd);
        match removed {
            Some(conn) => {
                conn.lock().unwrap().close();
                true
            }
            None => false,
        }
    }

    /// Close and drop every connection.
    pub fn clear(&self) {
        let drained: Vec<_> = self.map.write().unwrap().drain().collect();
        for (_, conn) in drained {
            conn.lock().unwrap().close();
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn socket_pair() -> (RawFd, RawFd) {
        let mut fds = [0 as RawFd; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        (fds[0], fds[1])
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:0".parse().unwrap()
    }

    fn read_all(fd: RawFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            if n <= 0 {
                break;
            }
            out.extend_from_slice(&buf[..n as usize]);
        }
        out
    }

    #[test]
    fn parse_and_respond_round_trip() {
        let (ours, theirs) = socket_pair();
        let request = b"GET /hi HTTP/1.1\r\nHost: t\r\n\r\n";
        let n = unsafe {
            libc::write(theirs, request.as_ptr() as *const libc::c_void, request.len())
        };
        assert_eq!(n as usize, request.len());

        let mut conn = Connection::new(ours, peer(), 4096);
        let (state, req) = conn.parse_from_fd(true);
        assert_eq!(state, ParseState::Complete);
        let req = req.unwrap();
        assert_eq!(req.uri(), "/hi");
        assert!(conn.keep_alive());

        conn.writer().write("hello");
        conn.assemble_response();
        assert!(conn.has_pending_write());
        let sent = conn.send().unwrap();
        assert!(sent > 0);
        assert_eq!(conn.pending_bytes(), 0);

        let bytes = read_all(theirs);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.ends_with("\r\n\r\nhello"));

        unsafe {
            libc::close(theirs);
        }
    }

    #[test]
    fn connection_close_header_clears_keep_alive() {
        let (ours, theirs) = socket_pair();
        let request = b"GET / HTTP/1.1\r\nConnection: close\r\n\r\n";
        unsafe {
            libc::write(theirs, request.as_ptr() as *const libc::c_void, request.len());
        }
        let mut conn = Connection::new(ours, peer(), 4096);
        let (state, _) = conn.parse_from_fd(true);
        assert_eq!(state, ParseState::Complete);
        assert!(!conn.keep_alive());
        unsafe {
            libc::close(theirs);
        }
    }

    #[test]
    fn reset_preserves_descriptor() {
        let (ours, theirs) = socket_pair();
        let mut conn = Connection::new(ours, peer(), 4096);
        conn.writer().write("x");
        conn.assemble_response();
        conn.reset();
        assert!(!conn.has_pending_write());
        assert!(!conn.is_closed());
        assert_eq!(conn.fd(), ours);
        unsafe {
            libc::close(theirs);
        }
    }

    #[test]
    fn close_is_idempotent() {
        let (ours, theirs) = socket_pair();
        let mut conn = Connection::new(ours, peer(), 4096);
        assert!(conn.close());
        assert!(!conn.close());
        assert!(conn.is_closed());
        unsafe {
            libc::close(theirs);
        }
    }

    #[test]
    fn table_rejects_duplicate_fd() {
        let (a, b) = socket_pair();
        let table = ConnectionTable::new();
        assert!(table.insert(a, Connection::new(a, peer(), 4096)).is_some());
        assert!(table.insert(a, Connection::new(a, peer(), 4096)).is_none());
        assert_eq!(table.len(), 1);
        assert!(table.close(a));
        assert!(!table.close(a));
        assert!(table.is_empty());
        unsafe {
            libc::close(b);
        }
    }

    #[test]
    fn table_clear_closes_everything() {
        let table = ConnectionTable::new();
        let mut spares = Vec::new();
        for _ in 0..4 {
            let (a, b) = socket_pair();
            table.insert(a, Connection::new(a, peer(), 4096));
            spares.push(b);
        }
        assert_eq!(table.len(), 4);
        table.clear();
        assert!(table.is_empty());
        for fd in spares {
            unsafe {
                libc::close(fd);
            }
        }
    }
}

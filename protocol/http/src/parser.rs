//! Incremental request parser.
//!
//! The parser accumulates bytes in a private contiguous buffer and drives a
//! state machine over it until it stalls (needs more input), completes a
//! request, or parks in a terminal error state. Field terminators are the
//! exact two bytes `\r\n`; a lone CR or LF is part of the field.

use std::os::unix::io::RawFd;

use bytes::{Buf, BytesMut};

use crate::header;
use crate::request::{Method, Request};

/// Bytes read from the socket per syscall while draining.
const READ_CHUNK: usize = 5 * 1024;

/// A request line or header line longer than this without a CRLF is treated
/// as malformed rather than buffered forever.
const MAX_LINE: usize = 8 * 1024;

/// Cap on the accumulated header block before the empty line shows up.
const MAX_HEADER_BLOCK: usize = 32 * 1024;

/// Parser states. The `Error*` states are terminal: the owning connection
/// must be closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseState {
    Init,
    RequestLine,
    Header,
    AwaitingBodySize,
    Body,
    Complete,
    ErrorRead,
    ErrorRequestLine,
    ErrorHeader,
    ErrorMissingEmptyLine,
    ErrorBodyLength,
}

impl ParseState {
    pub fn is_error(self) -> bool {
        matches!(
            self,
            ParseState::ErrorRead
                | ParseState::ErrorRequestLine
                | ParseState::ErrorHeader
                | ParseState::ErrorMissingEmptyLine
                | ParseState::ErrorBodyLength
        )
    }
}

/// Resumable HTTP/1.x request parser.
pub struct RequestParser {
    buf: BytesMut,
    state: ParseState,
    request: Option<Request>,
    /// Declared body length once the header block is done.
    body_len: usize,
    /// Set when a drain observed EOF from the peer.
    peer_closed: bool,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        RequestParser {
            buf: BytesMut::with_capacity(READ_CHUNK),
            state: ParseState::Init,
            request: None,
            body_len: 0,
            peer_closed: false,
        }
    }

    pub fn state(&self) -> ParseState {
        self.state
    }

    /// Whether a drain saw the peer close its end.
    pub fn peer_closed(&self) -> bool {
        self.peer_closed
    }

    /// Reset everything for a fresh connection or a fresh keep-alive cycle.
    pub fn clear(&mut self) {
        self.buf.clear();
        self.state = ParseState::Init;
        self.request = None;
        self.body_len = 0;
        self.peer_closed = false;
    }

    /// Feed bytes and run the state machine.
    pub fn consume(&mut self, data: &[u8]) -> (ParseState, Option<Request>) {
        self.rollover();
        if self.state.is_error() {
            return (self.state, None);
        }
        self.buf.extend_from_slice(data);
        self.drive()
    }

    /// Drain a non-blocking descriptor into the buffer, then run the state
    /// machine.
    ///
    /// In edge-triggered mode the socket is read until it would block; in
    /// level-triggered mode a single successful read suffices (the kernel
    /// will re-report the readiness). EOF mid-request parks the parser in
    /// `ErrorRead` with [`RequestParser::peer_closed`] set so the caller can
    /// close quietly instead of logging a protocol error.
    pub fn consume_from_fd(&mut self, fd: RawFd, edge_triggered: bool) -> (ParseState, Option<Request>) {
        self.rollover();
        if self.state.is_error() {
            return (self.state, None);
        }
        loop {
            self.buf.reserve(READ_CHUNK);
            let spare = self.buf.spare_capacity_mut();
            let n = unsafe {
                libc::read(
                    fd,
                    spare.as_mut_ptr() as *mut libc::c_void,
                    spare.len(),
                )
            };
            if n > 0 {
                unsafe { self.buf.set_len(self.buf.len() + n as usize) };
                if !edge_triggered {
                    break;
                }
                continue;
            }
            if n == 0 {
                self.peer_closed = true;
                if self.state != ParseState::Init || !self.buf.is_empty() {
                    self.state = ParseState::ErrorRead;
                }
                break;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => break,
                Some(libc::EINTR) => continue,
                _ => {
                    self.state = ParseState::ErrorRead;
                    break;
                }
            }
        }
        if self.state.is_error() {
            return (self.state, None);
        }
        self.drive()
    }

    /// Leaving COMPLETE happens on the next consume call.
    fn rollover(&mut self) {
        if self.state == ParseState::Complete {
            self.state = ParseState::Init;
            self.body_len = 0;
        }
    }

    /// Run the state machine until it stalls, completes, or errors.
    fn drive(&mut self) -> (ParseState, Option<Request>) {
        loop {
            match self.state {
                ParseState::Init => {
                    self.request = Some(Request::default());
                    self.body_len = 0;
                    self.state = ParseState::RequestLine;
                }
                ParseState::RequestLine => {
                    let Some(line) = self.take_line(MAX_LINE, ParseState::ErrorRequestLine) else {
                        break;
                    };
                    let Some(line) = line else { break };
                    if !self.parse_request_line(&line) {
                        self.state = ParseState::ErrorRequestLine;
                        break;
                    }
                    self.state = ParseState::Header;
                }
                ParseState::Header => {
                    let Some(line) =
                        self.take_line(MAX_HEADER_BLOCK, ParseState::ErrorMissingEmptyLine)
                    else {
                        break;
                    };
                    let Some(line) = line else { break };
                    if line.is_empty() {
                        self.state = ParseState::AwaitingBodySize;
                        continue;
                    }
                    if !self.parse_header_line(&line) {
                        self.state = ParseState::ErrorHeader;
                        break;
                    }
                }
                ParseState::AwaitingBodySize => {
                    let request = self.request.as_ref().expect("request in progress");
                    match request.headers.get(header::CONTENT_LENGTH) {
                        Some(value) => match value.trim().parse::<usize>() {
                            Ok(n) => {
                                self.body_len = n;
                                self.state = ParseState::Body;
                            }
                            Err(_) => {
                                self.state = ParseState::ErrorBodyLength;
                                break;
                            }
                        },
                        None if request.method.carries_body() => {
                            self.state = ParseState::ErrorBodyLength;
                            break;
                        }
                        None => {
                            self.body_len = 0;
                            self.state = ParseState::Body;
                        }
                    }
                }
                ParseState::Body => {
                    let request = self.request.as_mut().expect("request in progress");
                    let need = self.body_len - request.body.len();
                    let take = need.min(self.buf.len());
                    if take > 0 {
                        request.body.extend_from_slice(&self.buf[..take]);
                        self.buf.advance(take);
                    }
                    if request.body.len() < self.body_len {
                        break;
                    }
                    // Exactly the declared length; anything left over before
                    // the next cycle is a framing violation in this profile.
                    if !self.buf.is_empty() {
                        self.state = ParseState::ErrorBodyLength;
                        break;
                    }
                    self.state = ParseState::Complete;
                    let request = self.request.take();
                    return (ParseState::Complete, request);
                }
                _ => break,
            }
        }
        (self.state, None)
    }

    /// Pop one CRLF-terminated line off the buffer.
    ///
    /// Returns `None` when the parser just entered `overflow_state` (`cap`
    /// bytes accumulated without a terminator), `Some(None)` when more input
    /// is needed, and `Some(Some(line))` otherwise.
    fn take_line(&mut self, cap: usize, overflow_state: ParseState) -> Option<Option<String>> {
        match find_crlf(&self.buf) {
            Some(at) => {
                let line = String::from_utf8_lossy(&self.buf[..at]).into_owned();
                self.buf.advance(at + 2);
                Some(Some(line))
            }
            None if self.buf.len() > cap => {
                self.state = overflow_state;
                None
            }
            None => Some(None),
        }
    }

    /// `METHOD SP TARGET SP HTTP/VERSION` with single spaces and a known
    /// method.
    fn parse_request_line(&mut self, line: &str) -> bool {
        let mut parts = line.splitn(3, ' ');
        let (Some(method), Some(target), Some(proto)) =
            (parts.next(), parts.next(), parts.next())
        else {
            return false;
        };
        if method.is_empty() || target.is_empty() || proto.contains(' ') {
            return false;
        }
        let Some(version) = proto.strip_prefix("HTTP/") else {
            return false;
        };
        let request = self.request.as_mut().expect("request in progress");
        request.method = Method::parse(method);
        request.uri = target.to_string();
        request.version = version.to_string();
        request.method != Method::Unknown
    }

    /// `name: value` with an optional single space after the colon.
    fn parse_header_line(&mut self, line: &str) -> bool {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        if name.is_empty() {
            return false;
        }
        let value = value.strip_prefix(' ').unwrap_or(value);
        let request = self.request.as_mut().expect("request in progress");
        request.headers.insert(name, value);
        true
    }
}

fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_all(data: &[u8]) -> (ParseState, Option<Request>) {
        let mut parser = RequestParser::new();
        parser.consume(data)
    }

    #[test]
    fn simple_get_in_one_shot() {
        let (state, req) =
            parse_all(b"GET /index.html HTTP/1.1\r\nHost: example\r\n\r\n");
        assert_eq!(state, ParseState::Complete);
        let req = req.unwrap();
        assert_eq!(req.method(), Method::Get);
        assert_eq!(req.uri(), "/index.html");
        assert_eq!(req.version(), "1.1");
        assert_eq!(req.headers().get("host"), Some("example"));
        assert!(req.body().is_empty());
    }

    #[test]
    fn post_with_body() {
        let (state, req) =
            parse_all(b"POST /e HTTP/1.1\r\nHost: x\r\nContent-Length: 5\r\n\r\nhello");
        assert_eq!(state, ParseState::Complete);
        assert_eq!(req.unwrap().body(), b"hello");
    }

    #[test]
    fn any_chunking_yields_the_same_request() {
        let raw = b"POST /submit HTTP/1.1\r\nHost: x\r\nContent-Length: 11\r\n\r\nhello world";
        for split in 1..raw.len() {
            let mut parser = RequestParser::new();
            let (state, req) = parser.consume(&raw[..split]);
            let (state, req) = if req.is_some() {
                (state, req)
            } else {
                assert!(!state.is_error(), "split at {split} errored early");
                parser.consume(&raw[split..])
            };
            assert_eq!(state, ParseState::Complete, "split at {split}");
            let req = req.unwrap();
            assert_eq!(req.uri(), "/submit");
            assert_eq!(req.body(), b"hello world");
        }
    }

    #[test]
    fn three_chunk_large_body_completes_once() {
        let body: Vec<u8> = (0..12_289u32).map(|i| (i % 127) as u8).collect();
        let head = format!(
            "POST /upload HTTP/1.1\r\nHost: x\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        let mut parser = RequestParser::new();

        let mut raw = head.into_bytes();
        raw.extend_from_slice(&body);
        let first = raw.len() - 12_289 + 4096;

        let (state, req) = parser.consume(&raw[..first]);
        assert_eq!(state, ParseState::Body);
        assert!(req.is_none());
        let (state, req) = parser.consume(&raw[first..first + 8192]);
        assert_eq!(state, ParseState::Body);
        assert!(req.is_none());
        let (state, req) = parser.consume(&raw[first + 8192..]);
        assert_eq!(state, ParseState::Complete);
        assert_eq!(req.unwrap().body().len(), 12_289);
    }

    #[test]
    fn unknown_method_is_rejected() {
        let (state, _) = parse_all(b"BREW /pot HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParseState::ErrorRequestLine);
    }

    #[test]
    fn missing_http_prefix_is_rejected() {
        let (state, _) = parse_all(b"GET / FTP/1.1\r\n\r\n");
        assert_eq!(state, ParseState::ErrorRequestLine);
    }

    #[test]
    fn overlong_request_line_is_rejected() {
        let mut raw = b"GET /".to_vec();
        raw.extend(std::iter::repeat_n(b'a', MAX_LINE + 10));
        let (state, _) = parse_all(&raw);
        assert_eq!(state, ParseState::ErrorRequestLine);
    }

    #[test]
    fn header_without_colon_is_rejected() {
        let (state, _) = parse_all(b"GET / HTTP/1.1\r\nbogus line\r\n\r\n");
        assert_eq!(state, ParseState::ErrorHeader);
    }

    #[test]
    fn lone_cr_or_lf_is_not_a_terminator() {
        let mut parser = RequestParser::new();
        let (state, _) = parser.consume(b"GET / HTTP/1.1\rSTILL-THE-LINE");
        assert_eq!(state, ParseState::RequestLine);
        let (state, _) = parser.consume(b"\nmore");
        assert_eq!(state, ParseState::RequestLine);
    }

    #[test]
    fn post_without_content_length_is_rejected() {
        let (state, _) = parse_all(b"POST /e HTTP/1.1\r\nHost: x\r\n\r\n");
        assert_eq!(state, ParseState::ErrorBodyLength);
    }

    #[test]
    fn negative_content_length_is_rejected() {
        let (state, _) =
            parse_all(b"POST /e HTTP/1.1\r\nContent-Length: -5\r\n\r\nhello");
        assert_eq!(state, ParseState::ErrorBodyLength);
    }

    #[test]
    fn body_longer_than_declared_is_rejected() {
        let (state, _) =
            parse_all(b"POST /e HTTP/1.1\r\nContent-Length: 2\r\n\r\nhello");
        assert_eq!(state, ParseState::ErrorBodyLength);
    }

    #[test]
    fn short_body_stalls_until_more_input() {
        let mut parser = RequestParser::new();
        let (state, req) =
            parser.consume(b"POST /e HTTP/1.1\r\nContent-Length: 10\r\n\r\nhi");
        assert_eq!(state, ParseState::Body);
        assert!(req.is_none());
    }

    #[test]
    fn duplicate_header_keeps_last() {
        let (_, req) = parse_all(b"GET / HTTP/1.1\r\nX-K: one\r\nx-k: two\r\n\r\n");
        assert_eq!(req.unwrap().headers().get("X-K"), Some("two"));
    }

    #[test]
    fn value_keeps_inner_whitespace() {
        let (_, req) = parse_all(b"GET / HTTP/1.1\r\nX-K:  padded \r\n\r\n");
        // Only the single space after the colon is stripped.
        assert_eq!(req.unwrap().headers().get("X-K"), Some(" padded "));
    }

    #[test]
    fn keep_alive_cycle_parses_next_request() {
        let mut parser = RequestParser::new();
        let (state, req) = parser.consume(b"GET /a HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParseState::Complete);
        assert_eq!(req.unwrap().uri(), "/a");

        let (state, req) = parser.consume(b"GET /b HTTP/1.1\r\n\r\n");
        assert_eq!(state, ParseState::Complete);
        assert_eq!(req.unwrap().uri(), "/b");
    }

    mod fd {
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

        fn send(fd: RawFd, data: &[u8]) {
            let n = unsafe {
                libc::write(fd, data.as_ptr() as *const libc::c_void, data.len())
            };
            assert_eq!(n as usize, data.len());
        }

        fn close(fd: RawFd) {
            unsafe {
                libc::close(fd);
            }
        }

        #[test]
        fn edge_triggered_drains_whole_request() {
            let (ours, theirs) = socket_pair();
            send(theirs, b"GET /et HTTP/1.1\r\nHost: x\r\n\r\n");

            let mut parser = RequestParser::new();
            let (state, req) = parser.consume_from_fd(ours, true);
            assert_eq!(state, ParseState::Complete);
            assert_eq!(req.unwrap().uri(), "/et");

            close(ours);
            close(theirs);
        }

        #[test]
        fn level_triggered_accumulates_across_calls() {
            let (ours, theirs) = socket_pair();
            send(theirs, b"GET /lt HTTP/1.1\r\n");
            let mut parser = RequestParser::new();
            let (state, _) = parser.consume_from_fd(ours, false);
            assert_eq!(state, ParseState::Header);

            send(theirs, b"Host: x\r\n\r\n");
            let (state, req) = parser.consume_from_fd(ours, false);
            assert_eq!(state, ParseState::Complete);
            assert_eq!(req.unwrap().uri(), "/lt");

            close(ours);
            close(theirs);
        }

        #[test]
        fn eof_mid_request_reports_peer_close() {
            let (ours, theirs) = socket_pair();
            send(theirs, b"GET /partial HTTP");
            let mut parser = RequestParser::new();
            let (state, _) = parser.consume_from_fd(ours, true);
            assert_eq!(state, ParseState::RequestLine);

            close(theirs);
            let (state, req) = parser.consume_from_fd(ours, true);
            assert_eq!(state, ParseState::ErrorRead);
            assert!(parser.peer_closed());
            assert!(req.is_none());

            close(ours);
        }
    }
}

//! Response assembly.
//!
//! Handlers write status, headers, and body into a [`ResponseWriter`]; the
//! connection then serializes the status line and header block in front of
//! the accumulated body segments, so an `mmap`ed body is never copied.

use bufvec::{BufVec, ReleaseFn};
use protocol_http::{Response, header};

/// Builder for one response. Once flushed into the outbound buffer the
/// writer ignores further mutation until it is cleared for the next
/// keep-alive cycle.
pub struct ResponseWriter {
    response: Response,
    body: BufVec,
    flushed: bool,
}

impl Default for ResponseWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::with_segment_capacity(bufvec::DEFAULT_SEGMENT_CAPACITY)
    }

    pub fn with_segment_capacity(capacity: usize) -> Self {
        ResponseWriter {
            response: Response::default(),
            body: BufVec::with_segment_capacity(capacity),
            flushed: false,
        }
    }

    pub fn status(&self) -> u16 {
        self.response.status()
    }

    /// Set the status code (defaults to 200). Ignored once flushed.
    pub fn set_status(&mut self, status: u16) {
        if !self.flushed {
            self.response.set_status(status);
        }
    }

    /// Override the canonical reason phrase.
    pub fn set_reason(&mut self, reason: impl Into<String>) {
        if !self.flushed {
            self.response.set_reason(reason);
        }
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        if !self.flushed {
            self.response.set_version(version);
        }
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.response.headers().get(name)
    }

    pub fn set_header(&mut self, name: impl Into<String>, value: impl Into<String>) {
        if !self.flushed {
            self.response.headers_mut().insert(name, value);
        }
    }

    /// Append bytes to the body.
    pub fn write(&mut self, data: impl AsRef<[u8]>) {
        if !self.flushed {
            self.body.write(data.as_ref());
        }
    }

    /// Splice an externally-owned region into the body without copying.
    /// `release` is invoked exactly once when the segment is destroyed.
    ///
    /// # Safety
    ///
    /// Same contract as [`BufVec::adopt`]: the region must stay valid and
    /// unaliased until `release` runs.
    pub unsafe fn adopt(&mut self, ptr: *mut u8, len: usize, release: ReleaseFn, readonly: bool) {
        if !self.flushed {
            unsafe { self.body.adopt(ptr, len, release, readonly) };
        }
    }

    pub fn body_len(&self) -> usize {
        self.body.readable_len()
    }

    pub fn is_flushed(&self) -> bool {
        self.flushed
    }

    /// Serialize the status line and header block into `out`, then splice
    /// the body segments after them. Fills in `Content-Length` from the body
    /// when the handler did not set it, and emits `Connection: close` when
    /// this response ends the connection.
    pub fn serialize_into(&mut self, keep_alive: bool, out: &mut BufVec) {
        if self.flushed {
            return;
        }

        if self.response.headers().get(header::CONTENT_LENGTH).is_none() {
            let length = self.body.readable_len().to_string();
            self.response
                .headers_mut()
                .insert(header::CONTENT_LENGTH, length);
        }
        if !keep_alive {
            self.response.headers_mut().insert(header::CONNECTION, "close");
        }

        let mut head = String::with_capacity(128);
        head.push_str("HTTP/");
        head.push_str(self.response.version());
        head.push(' ');
        head.push_str(&self.response.status().to_string());
        head.push(' ');
        head.push_str(self.response.reason());
        head.push_str("\r\n");
        for (name, value) in self.response.headers().iter() {
            head.push_str(name);
            head.push_str(": ");
            head.push_str(value);
            head.push_str("\r\n");
        }
        head.push_str("\r\n");

        out.write(head.as_bytes());
        out.append(&mut self.body);
        self.flushed = true;
    }

    /// Reset for the next request on a keep-alive connection.
    pub fn clear(&mut self) {
        self.response.clear();
        self.body.clear();
        self.flushed = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rendered(writer: &mut ResponseWriter, keep_alive: bool) -> Vec<u8> {
        let mut out = BufVec::new();
        writer.serialize_into(keep_alive, &mut out);
        let mut bytes = vec![0u8; out.readable_len()];
        out.read(&mut bytes);
        bytes
    }

    #[test]
    fn serializes_status_line_headers_and_body() {
        let mut writer = ResponseWriter::new();
        writer.set_status(200);
        writer.set_header("X-Test", "yes");
        writer.write("ok");

        let bytes = rendered(&mut writer, true);
        let text = String::from_utf8(bytes).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("X-Test: yes\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("\r\n\r\nok"));
    }

    #[test]
    fn close_adds_connection_header() {
        let mut writer = ResponseWriter::new();
        let text = String::from_utf8(rendered(&mut writer, false)).unwrap();
        assert!(text.contains("Connection: close\r\n"));
    }

    #[test]
    fn explicit_content_length_is_not_overridden() {
        let mut writer = ResponseWriter::new();
        writer.set_header("Content-Length", "99");
        let text = String::from_utf8(rendered(&mut writer, true)).unwrap();
        assert!(text.contains("Content-Length: 99\r\n"));
    }

    #[test]
    fn flushed_writer_is_immutable() {
        let mut writer = ResponseWriter::new();
        writer.write("body");
        let first = rendered(&mut writer, true);
        assert!(!first.is_empty());

        writer.set_status(500);
        writer.write("more");
        assert_eq!(writer.status(), 200);
        assert_eq!(writer.body_len(), 0);

        // A second flush is a no-op until cleared.
        let second = rendered(&mut writer, true);
        assert!(second.is_empty());

        writer.clear();
        writer.set_status(404);
        assert_eq!(writer.status(), 404);
    }

    #[test]
    fn adopted_body_is_spliced_after_headers() {
        let data = b"mapped".to_vec().into_boxed_slice();
        let ptr = Box::into_raw(data) as *mut u8;
        let mut writer = ResponseWriter::new();
        writer.write("pre-");
        unsafe {
            writer.adopt(
                ptr,
                6,
                Box::new(|p, n| drop(unsafe {
                    Box::from_raw(std::ptr::slice_from_raw_parts_mut(p, n))
                })),
                true,
            );
        }
        let text = String::from_utf8(rendered(&mut writer, true)).unwrap();
        assert!(text.ends_with("\r\n\r\npre-mapped"));
        assert!(text.contains("Content-Length: 10\r\n"));
    }
}

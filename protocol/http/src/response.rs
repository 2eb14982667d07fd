//! Response model and the canonical reason-phrase table.

use crate::header::HeaderMap;

/// Status line and header block of a response. The body is assembled
/// separately (it may span multiple buffer segments).
#[derive(Debug, Clone)]
pub struct Response {
    version: String,
    status: u16,
    reason: Option<String>,
    headers: HeaderMap,
}

impl Default for Response {
    fn default() -> Self {
        Response {
            version: "1.1".to_string(),
            status: 200,
            reason: None,
            headers: HeaderMap::new(),
        }
    }
}

impl Response {
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_version(&mut self, version: impl Into<String>) {
        self.version = version.into();
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Accepts any IANA code in the 1xx–5xx ranges; anything else is ignored.
    pub fn set_status(&mut self, status: u16) {
        if is_valid_status(status) {
            self.status = status;
        }
    }

    /// The reason phrase to emit: the explicit one if set, else the canonical
    /// phrase for the status code, else empty.
    pub fn reason(&self) -> &str {
        match &self.reason {
            Some(reason) => reason,
            None => reason_phrase(self.status).unwrap_or(""),
        }
    }

    pub fn set_reason(&mut self, reason: impl Into<String>) {
        self.reason = Some(reason.into());
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn headers_mut(&mut self) -> &mut HeaderMap {
        &mut self.headers
    }

    pub fn clear(&mut self) {
        *self = Response::default();
    }
}

/// Whether `status` falls in the accepted IANA ranges (1xx–5xx).
pub fn is_valid_status(status: u16) -> bool {
    (100..600).contains(&status)
}

/// Canonical reason phrase for an IANA status code.
pub fn reason_phrase(status: u16) -> Option<&'static str> {
    let phrase = match status {
        100 => "Continue",
        101 => "Switching Protocols",
        102 => "Processing",
        103 => "Early Hints",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        203 => "Non-Authoritative Information",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        207 => "Multi-Status",
        208 => "Already Reported",
        226 => "IM Used",
        300 => "Multiple Choices",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        305 => "Use Proxy",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        402 => "Payment Required",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        406 => "Not Acceptable",
        407 => "Proxy Authentication Required",
        408 => "Request Timeout",
        409 => "Conflict",
        410 => "Gone",
        411 => "Length Required",
        412 => "Precondition Failed",
        413 => "Content Too Large",
        414 => "URI Too Long",
        415 => "Unsupported Media Type",
        416 => "Range Not Satisfiable",
        417 => "Expectation Failed",
        418 => "I'm a Teapot",
        421 => "Misdirected Request",
        422 => "Unprocessable Content",
        423 => "Locked",
        424 => "Failed Dependency",
        425 => "Too Early",
        426 => "Upgrade Required",
        428 => "Precondition Required",
        429 => "Too Many Requests",
        431 => "Request Header Fields Too Large",
        451 => "Unavailable For Legal Reasons",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        505 => "HTTP Version Not Supported",
        506 => "Variant Also Negotiates",
        507 => "Insufficient Storage",
        508 => "Loop Detected",
        510 => "Not Extended",
        511 => "Network Authentication Required",
        _ => return None,
    };
    Some(phrase)
}

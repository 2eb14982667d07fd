//! Request model.

use crate::form::{Form, parse_form};
use crate::header::{self, HeaderMap};

/// Request methods. Anything else parses as `Unknown` and is rejected by the
/// request-line stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    #[default]
    Unknown,
    Get,
    Post,
    Head,
    Put,
    Delete,
    Trace,
    Connect,
}

impl Method {
    pub fn parse(s: &str) -> Method {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Method::Get,
            "POST" => Method::Post,
            "HEAD" => Method::Head,
            "PUT" => Method::Put,
            "DELETE" => Method::Delete,
            "TRACE" => Method::Trace,
            "CONNECT" => Method::Connect,
            _ => Method::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Head => "HEAD",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Trace => "TRACE",
            Method::Connect => "CONNECT",
            Method::Unknown => "UNKNOWN",
        }
    }

    /// Whether this method is expected to carry a body, which makes
    /// `Content-Length` mandatory in this profile (no chunked encoding).
    pub fn carries_body(&self) -> bool {
        matches!(self, Method::Post | Method::Put)
    }
}

/// A parsed request.
#[derive(Debug, Default, Clone)]
pub struct Request {
    pub(crate) method: Method,
    pub(crate) uri: String,
    pub(crate) version: String,
    pub(crate) headers: HeaderMap,
    pub(crate) body: Vec<u8>,
}

impl Request {
    pub fn method(&self) -> Method {
        self.method
    }

    /// The request target exactly as it appeared on the request line.
    pub fn uri(&self) -> &str {
        &self.uri
    }

    /// Version string after `HTTP/`, e.g. `"1.1"`.
    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    /// Keep-alive decision for this request: HTTP/1.1 defaults to on unless
    /// `Connection: close`; HTTP/1.0 defaults to off unless
    /// `Connection: keep-alive`.
    pub fn is_keep_alive(&self) -> bool {
        let connection = self.headers.get(header::CONNECTION);
        match self.version.as_str() {
            "1.1" => !connection.is_some_and(|v| v.eq_ignore_ascii_case("close")),
            "1.0" => connection.is_some_and(|v| v.eq_ignore_ascii_case("keep-alive")),
            _ => false,
        }
    }

    /// The query-string portion of the target, if any.
    pub fn query(&self) -> Option<&str> {
        self.uri.rfind('?').map(|at| &self.uri[at + 1..])
    }

    /// Decode an `application/x-www-form-urlencoded` payload: the body for
    /// POST, the query string for GET. Returns an empty form when the
    /// content type does not match or there is nothing to decode.
    pub fn form(&self) -> Form {
        if self
            .headers
            .get(header::CONTENT_TYPE)
            .is_none_or(|v| v != "application/x-www-form-urlencoded")
        {
            return Form::default();
        }
        match self.method {
            Method::Post => match std::str::from_utf8(&self.body) {
                Ok(body) if !body.is_empty() => parse_form(body),
                _ => Form::default(),
            },
            Method::Get => self.query().map(parse_form).unwrap_or_default(),
            _ => Form::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(version: &str, connection: Option<&str>) -> Request {
        let mut req = Request {
            version: version.to_string(),
            ..Default::default()
        };
        if let Some(v) = connection {
            req.headers.insert("Connection", v);
        }
        req
    }

    #[test]
    fn method_parse_is_case_insensitive() {
        assert_eq!(Method::parse("get"), Method::Get);
        assert_eq!(Method::parse("Delete"), Method::Delete);
        assert_eq!(Method::parse("BREW"), Method::Unknown);
    }

    #[test]
    fn keep_alive_policy() {
        assert!(request("1.1", None).is_keep_alive());
        assert!(request("1.1", Some("keep-alive")).is_keep_alive());
        assert!(!request("1.1", Some("close")).is_keep_alive());
        assert!(!request("1.1", Some("Close")).is_keep_alive());
        assert!(!request("1.0", None).is_keep_alive());
        assert!(request("1.0", Some("keep-alive")).is_keep_alive());
        assert!(!request("1.0", Some("close")).is_keep_alive());
    }

    #[test]
    fn form_from_post_body() {
        let mut req = Request {
            method: Method::Post,
            body: b"a=1&b=two+words".to_vec(),
            ..Default::default()
        };
        req.headers
            .insert("Content-Type", "application/x-www-form-urlencoded");
        let form = req.form();
        assert_eq!(form.get("a"), Some("1"));
        assert_eq!(form.get("b"), Some("two words"));
    }

    #[test]
    fn form_from_get_query() {
        let mut req = Request {
            method: Method::Get,
            uri: "/search?q=rust%20lang".to_string(),
            ..Default::default()
        };
        req.headers
            .insert("Content-Type", "application/x-www-form-urlencoded");
        assert_eq!(req.form().get("q"), Some("rust lang"));
    }

    #[test]
    fn form_requires_content_type() {
        let req = Request {
            method: Method::Post,
            body: b"a=1".to_vec(),
            ..Default::default()
        };
        assert!(req.form().is_empty());
    }
}

//! Pattern → handler routing.
//!
//! Follows the net/http ServeMux convention: exact patterns match the
//! request target verbatim; patterns ending in '/' also match any target
//! they prefix, longest pattern first. A small sorted list beats a trie at
//! the handful of patterns a server actually registers.

use std::collections::HashMap;
use std::sync::Arc;

use protocol_http::Request;

use crate::writer::ResponseWriter;

/// A request handler. Handlers are synchronous and must not block without
/// bound; they run on a worker thread with exclusive access to the
/// connection.
pub type Handler = dyn Fn(&mut ResponseWriter, &Request) + Send + Sync;

/// Routing table. Registration happens at startup; lookups are read-only.
///
/// Handlers are owned by the exact-match map; the prefix list aliases them,
/// so removing a pattern drops both entries.
#[derive(Default)]
pub struct HandlerTable {
    exact: HashMap<String, Arc<Handler>>,
    /// Prefix patterns (ending in '/'), sorted by length descending;
    /// insertion order breaks ties.
    prefixes: Vec<(String, Arc<Handler>)>,
    fallback: Option<Arc<Handler>>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler. Empty and duplicate patterns are refused.
    pub fn register(
        &mut self,
        pattern: &str,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) -> bool {
        if pattern.is_empty() || self.exact.contains_key(pattern) {
            return false;
        }
        let handler: Arc<Handler> = Arc::new(handler);
        self.exact.insert(pattern.to_string(), handler.clone());
        if pattern.ends_with('/') {
            // Insert after any existing pattern of the same length so the
            // scan order stays stable.
            let at = self
                .prefixes
                .partition_point(|(existing, _)| existing.len() >= pattern.len());
            self.prefixes.insert(at, (pattern.to_string(), handler));
        }
        true
    }

    /// Remove a pattern, dropping its prefix alias as well.
    pub fn remove(&mut self, pattern: &str) -> bool {
        if self.exact.remove(pattern).is_none() {
            return false;
        }
        self.prefixes.retain(|(existing, _)| existing != pattern);
        true
    }

    /// Handler invoked when nothing matches.
    pub fn set_fallback(
        &mut self,
        handler: impl Fn(&mut ResponseWriter, &Request) + Send + Sync + 'static,
    ) {
        self.fallback = Some(Arc::new(handler));
    }

    /// Look up the handler for a request target: exact match first, then the
    /// longest matching prefix, then the fallback.
    pub fn route(&self, target: &str) -> Option<Arc<Handler>> {
        if let Some(handler) = self.exact.get(target) {
            return Some(handler.clone());
        }
        for (pattern, handler) in &self.prefixes {
            if target.starts_with(pattern.as_str()) {
                return Some(handler.clone());
            }
        }
        self.fallback.clone()
    }

    pub fn len(&self) -> usize {
        self.exact.len()
    }

    pub fn is_empty(&self) -> bool {
        self.exact.is_empty()
    }
}

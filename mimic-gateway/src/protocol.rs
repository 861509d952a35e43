//! Protocol Registry & Dispatcher (C4).
//!
//! Grounded on `listener.rs`'s peek-then-dispatch accept loop: peek the
//! first bytes, try sniffers in priority order, fall back to a generic
//! handler when nothing claims the connection. New protocols register a
//! descriptor without the dispatcher itself changing, per the
//! "polymorphism over protocol plugins" design note.

use std::sync::Arc;

/// The capability set a protocol plugin exposes to the dispatcher.
///
/// `sniff` sees at most the initial read buffer and must not block; the
/// record/mock handlers own the connection for the rest of its lifetime
/// once selected.
pub trait ProtocolPlugin: Send + Sync {
    fn name(&self) -> &'static str;

    /// Lower priority value is tried earlier.
    fn priority(&self) -> i32;

    fn sniff(&self, initial_bytes: &[u8]) -> bool;
}

/// A generic fallback plugin whose sniffer always returns `false`; it is
/// never selected by [`ProtocolRegistry::dispatch`] directly, but exists
/// so callers have an explicit "no protocol claimed this" terminal value
/// distinct from an empty registry.
pub struct GenericFallbackPlugin;

impl ProtocolPlugin for GenericFallbackPlugin {
    fn name(&self) -> &'static str {
        "generic"
    }

    fn priority(&self) -> i32 {
        i32::MAX
    }

    fn sniff(&self, _initial_bytes: &[u8]) -> bool {
        false
    }
}

/// Registry of plugin descriptors, kept sorted by priority at
/// registration time so dispatch is a linear scan in priority order.
#[derive(Clone)]
pub struct ProtocolRegistry {
    plugins: Vec<Arc<dyn ProtocolPlugin>>,
}

impl ProtocolRegistry {
    pub fn new() -> Self {
        Self { plugins: Vec::new() }
    }

    pub fn register(&mut self, plugin: Arc<dyn ProtocolPlugin>) {
        let insert_at = self.plugins.partition_point(|existing| existing.priority() <= plugin.priority());
        self.plugins.insert(insert_at, plugin);
    }

    /// Tries sniffers in priority order against `initial_bytes`, returning
    /// the first one that claims the connection, or `None` when nothing
    /// does (callers fall back to passthrough, per §4.4).
    pub fn dispatch(&self, initial_bytes: &[u8]) -> Option<Arc<dyn ProtocolPlugin>> {
        self.plugins.iter().find(|plugin| plugin.sniff(initial_bytes)).cloned()
    }
}

impl Default for ProtocolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The HTTP/1.1 plugin descriptor; sniffs on a known request-line method
/// token, which is sufficient given the initial read buffer always starts
/// at the request line for a freshly hijacked connection.
pub struct HttpPlugin;

const HTTP_METHOD_PREFIXES: &[&[u8]] = &[
    b"GET ", b"POST ", b"PUT ", b"DELETE ", b"HEAD ", b"OPTIONS ", b"PATCH ", b"CONNECT ", b"TRACE ",
];

impl ProtocolPlugin for HttpPlugin {
    fn name(&self) -> &'static str {
        "http"
    }

    fn priority(&self) -> i32 {
        0
    }

    fn sniff(&self, initial_bytes: &[u8]) -> bool {
        HTTP_METHOD_PREFIXES.iter().any(|prefix| initial_bytes.starts_with(prefix))
    }
}

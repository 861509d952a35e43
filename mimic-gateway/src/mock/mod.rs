//! Mock data model and the three collaborating pieces that operate on it:
//! the store (C6), the matcher (C7), and the capture sink (C8).

mod capture;
mod matcher;
mod store;

pub use capture::CaptureSink;
pub use matcher::{match_request, MatchOutcome};
pub use store::{MockStore, MockStoreHandle};

use std::collections::BTreeMap;

pub use mock_sink::MockKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MockId(pub u64);

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RequestPayload {
    pub method: String,
    pub url: String,
    pub headers: BTreeMap<String, String>,
    pub query: BTreeMap<String, Vec<String>>,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResponsePayload {
    pub status: u16,
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub gzip: bool,
}

/// A single stored mock (§3). Kind is immutable once constructed; the only
/// in-place mutations a consumer may ask the store to perform are
/// `flag_used` (idempotent) and `promote` (compare-and-swap on `version`).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mock {
    pub id: MockId,
    pub kind: MockKind,
    pub request: RequestPayload,
    pub response: ResponsePayload,
    pub request_at_ms: i64,
    pub response_at_ms: i64,
    pub filtered: bool,
    pub used: bool,
    pub sort_order: u64,
    pub(crate) version: u64,
}

impl Mock {
    pub fn new(id: MockId, kind: MockKind, request: RequestPayload, response: ResponsePayload, request_at_ms: i64) -> Self {
        Self {
            id,
            kind,
            request,
            response,
            request_at_ms,
            response_at_ms: request_at_ms,
            filtered: true,
            used: false,
            sort_order: 0,
            version: 0,
        }
    }
}

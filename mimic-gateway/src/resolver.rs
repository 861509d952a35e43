//! Destination Resolver (C2): (source port) -> original destination,
//! populated by the kernel redirector and consumed once by the session
//! controller at connection accept.

use std::net::IpAddr;
use std::sync::Arc;

use dashmap::DashMap;

/// (IP version, address, destination port, originating process id hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DestinationInfo {
    pub addr: IpAddr,
    pub port: u16,
    pub pid_hint: Option<u32>,
}

/// Concurrent map keyed by the hijacked connection's TCP source port.
///
/// `DashMap::remove` is already the atomic "read-then-delete" primitive
/// the contract requires: under concurrent resolve calls for the same
/// port, exactly one caller observes `Some`.
#[derive(Clone, Default)]
pub struct DestinationResolver {
    table: Arc<DashMap<u16, DestinationInfo>>,
}

impl DestinationResolver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writer side: the redirector populates an entry when it redirects a
    /// SYN on `src_port`.
    pub fn populate(&self, src_port: u16, info: DestinationInfo) {
        self.table.insert(src_port, info);
    }

    /// Reader side: C9 at connection accept. Clears the entry after
    /// lookup so a source port can be safely reused by a later
    /// connection.
    pub fn resolve(&self, src_port: u16) -> Option<DestinationInfo> {
        self.table.remove(&src_port).map(|(_, info)| info)
    }
}

//! Connection Tracker (C1): reassembles per-connection byte streams from
//! kernel events and decides completeness.
//!
//! Grounded on the shared-map-plus-periodic-sweeper shape: the sweeper
//! holds only a non-owning handle to the map (mirroring
//! `mimic-log`'s `LogDeleterTask`'s `tokio::select!` against a sleep and a
//! shutdown signal), while each record lives inside the map entry until
//! drained, avoiding a back-reference from record to sweeper.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use mimic_task::{ShutdownSignal, Task};
use time::OffsetDateTime;
use tracing::debug;

use crate::error::TrackerError;
use crate::kernel_event::{ClockOffset, ConnectionId, Direction, KernelEvent};

/// Per-connection state owned exclusively by the tracker until drained.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub id: ConnectionId,
    pub peer_addr: std::net::SocketAddr,
    pub opened_at_ms: i64,
    pub closed_at_ms: i64,
    pub bytes_written_reported: i64,
    pub bytes_read_reported: i64,
    pub ingress: Vec<u8>,
    pub egress: Vec<u8>,
    pub last_activity_ms: i64,
    drained: bool,
}

#[derive(Debug, PartialEq, Eq)]
pub enum Completeness {
    Open,
    Complete,
    Malformed(MalformedReason),
    Inactive,
}

#[derive(Debug, PartialEq, Eq)]
pub enum MalformedReason {
    BufferOverflow,
    ByteCountMismatch,
}

impl ConnectionRecord {
    fn new(id: ConnectionId, peer_addr: std::net::SocketAddr, opened_at_ms: i64) -> Self {
        Self {
            id,
            peer_addr,
            opened_at_ms,
            closed_at_ms: 0,
            bytes_written_reported: 0,
            bytes_read_reported: 0,
            ingress: Vec::new(),
            egress: Vec::new(),
            last_activity_ms: opened_at_ms,
            drained: false,
        }
    }

    fn append(&mut self, direction: Direction, msg: &[u8], cap: usize, now_ms: i64) -> Result<(), TrackerError> {
        let buf = match direction {
            Direction::Ingress => &mut self.ingress,
            Direction::Egress => &mut self.egress,
        };

        if buf.len() + msg.len() > cap {
            return Err(TrackerError::BufferOverflow);
        }

        buf.extend_from_slice(msg);
        self.last_activity_ms = now_ms;
        Ok(())
    }

    fn close(&mut self, written: i64, read: i64, now_ms: i64) {
        self.bytes_written_reported = written;
        self.bytes_read_reported = read;
        self.closed_at_ms = now_ms;
    }

    fn completeness(&self, inactivity_threshold: Duration, now_ms: i64) -> Completeness {
        if self.closed_at_ms != 0 {
            let egress_matches = self.egress.len() as i64 == self.bytes_written_reported;
            let ingress_matches = self.ingress.len() as i64 == self.bytes_read_reported;
            if egress_matches && ingress_matches {
                Completeness::Complete
            } else {
                Completeness::Malformed(MalformedReason::ByteCountMismatch)
            }
        } else if now_ms - self.last_activity_ms > inactivity_threshold.as_millis() as i64 {
            Completeness::Inactive
        } else {
            Completeness::Open
        }
    }
}

pub(crate) fn now_ms() -> i64 {
    let now = OffsetDateTime::now_utc();
    now.unix_timestamp() * 1000 + i64::from(now.millisecond())
}

/// Shared, concurrently-accessed table of in-flight connection records.
///
/// Serialization per `ConnectionId` is provided by `DashMap`'s internal
/// per-shard locking: two events for the same connection contend on the
/// same entry guard, while events for distinct connections proceed in
/// parallel, matching the ordering guarantees in the concurrency model.
#[derive(Clone)]
pub struct ConnectionTracker {
    records: Arc<DashMap<ConnectionId, ConnectionRecord>>,
    buffer_cap_bytes: usize,
    inactivity_threshold: Duration,
    clock_offset: ClockOffset,
}

impl ConnectionTracker {
    pub fn new(buffer_cap_bytes: usize, inactivity_threshold: Duration, clock_offset: ClockOffset) -> Self {
        Self {
            records: Arc::new(DashMap::new()),
            buffer_cap_bytes,
            inactivity_threshold,
            clock_offset,
        }
    }

    /// Applies one kernel event to the table, creating a record lazily on
    /// first sight of an unknown `ConnectionId`. Every timestamp stored on
    /// the record comes from the event's own monotonic `timestamp_ns`,
    /// corrected to wall clock via `clock_offset`, not from the time this
    /// call happens to run.
    pub fn apply(&self, event: KernelEvent) {
        match event {
            KernelEvent::Open { conn, addr, timestamp_ns } => {
                let opened_at_ms = self.clock_offset.to_wall_clock_ms(timestamp_ns);
                self.records.entry(conn).or_insert_with(|| ConnectionRecord::new(conn, addr, opened_at_ms));
            }
            KernelEvent::Data { conn, direction, msg, timestamp_ns } => {
                let at = self.clock_offset.to_wall_clock_ms(timestamp_ns);
                if let Some(mut record) = self.records.get_mut(&conn) {
                    if let Err(error) = record.append(direction, &msg, self.buffer_cap_bytes, at) {
                        debug!(?conn, %error, "connection record became malformed");
                    }
                }
            }
            KernelEvent::Close { conn, written, read, timestamp_ns } => {
                let at = self.clock_offset.to_wall_clock_ms(timestamp_ns);
                if let Some(mut record) = self.records.get_mut(&conn) {
                    record.close(written, read, at);
                }
            }
        }
    }

    /// One sweep: removes every record that is complete, malformed, or
    /// inactive, returning the drained ones for downstream processing.
    /// A record is eligible for drain exactly once, because removal from
    /// the map and extraction of its buffers happen together.
    pub(crate) fn sweep_once(&self) -> Vec<ConnectionRecord> {
        let now = now_ms();
        let mut to_remove = Vec::new();

        for entry in self.records.iter() {
            match entry.value().completeness(self.inactivity_threshold, now) {
                Completeness::Open => {}
                other => to_remove.push((*entry.key(), other)),
            }
        }

        let mut drained = Vec::with_capacity(to_remove.len());
        for (conn, outcome) in to_remove {
            if let Some((_, mut record)) = self.records.remove(&conn) {
                record.drained = true;
                match outcome {
                    Completeness::Complete => drained.push(record),
                    Completeness::Malformed(reason) => {
                        debug!(?conn, ?reason, "dropping malformed connection record");
                    }
                    Completeness::Inactive => {
                        debug!(?conn, "dropping inactive connection record");
                    }
                    Completeness::Open => unreachable!("filtered above"),
                }
            }
        }

        drained
    }
}

/// Periodic sweeper task (C1's background half); drains completed records
/// into the supplied callback and discards malformed/inactive ones.
pub struct TrackerSweeper<F> {
    tracker: ConnectionTracker,
    interval: Duration,
    on_drained: F,
}

impl<F> TrackerSweeper<F>
where
    F: Fn(ConnectionRecord) + Send + Sync + 'static,
{
    pub fn new(tracker: ConnectionTracker, interval: Duration, on_drained: F) -> Self {
        Self {
            tracker,
            interval,
            on_drained,
        }
    }
}

#[async_trait]
impl<F> Task for TrackerSweeper<F>
where
    F: Fn(ConnectionRecord) + Send + Sync + 'static,
{
    type Output = ();

    const NAME: &'static str = "connection tracker sweeper";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    for record in self.tracker.sweep_once() {
                        (self.on_drained)(record);
                    }
                }
                _ = shutdown_signal.wait() => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn addr() -> std::net::SocketAddr {
        std::net::SocketAddr::from(([127, 0, 0, 1], 4000))
    }

    proptest! {
        /// A connection closed with reported byte counts equal to the
        /// buffers actually appended is complete; any mismatch is
        /// malformed, never silently accepted as complete.
        #[test]
        fn completeness_matches_reported_byte_counts(
            ingress_len in 0usize..64,
            egress_len in 0usize..64,
            written_delta in -4i64..4,
            read_delta in -4i64..4,
        ) {
            let id = ConnectionId { tgid: 1, fd: 2, tsid: 3 };
            let mut record = ConnectionRecord::new(id, addr(), 0);

            record.append(Direction::Ingress, &vec![0u8; ingress_len], usize::MAX, 0).unwrap();
            record.append(Direction::Egress, &vec![0u8; egress_len], usize::MAX, 0).unwrap();

            let reported_read = ingress_len as i64 + read_delta;
            let reported_written = egress_len as i64 + written_delta;
            // `closed_at_ms == 0` is the sentinel `completeness` uses for
            // "never closed", so the close timestamp here must be nonzero.
            record.close(reported_written, reported_read, 1_000);

            let outcome = record.completeness(Duration::from_secs(60), 1_000);
            let byte_counts_match = reported_read == ingress_len as i64 && reported_written == egress_len as i64;

            prop_assert_eq!(outcome == Completeness::Complete, byte_counts_match);
        }
    }
}

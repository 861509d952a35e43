//! Kernel Event Intake (A4) background task: reads the three kernel event
//! wire streams from §6 to exhaustion, decodes each fixed-size record, and
//! feeds the connection tracker (C1).
//!
//! The kernel hook itself is out of scope; this task only needs something
//! that implements `AsyncRead` on the other end, so callers can point it at
//! a Unix socket, a named pipe, or (in tests) an in-memory duplex stream.

use async_trait::async_trait;
use mimic_task::{ShutdownSignal, Task};
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

use crate::kernel_event::{decode_close, decode_data, decode_open, DecodeError, KernelEvent, DATA_MSG_CAPACITY};
use crate::tracker::ConnectionTracker;

const CONNECTION_ID_LEN: usize = 4 + 4 + 8;
const OPEN_RECORD_LEN: usize = 8 + CONNECTION_ID_LEN + (2 + 2 + 4 + 8);
const DATA_RECORD_LEN: usize = 8 + CONNECTION_ID_LEN + 4 + 4 + 8 + DATA_MSG_CAPACITY + 8 + 8;
const CLOSE_RECORD_LEN: usize = 8 + CONNECTION_ID_LEN + 8 + 8;

/// A single kernel event stream, type-erased so the binary entrypoint can
/// hand in a Unix socket, a named pipe, or anything else `AsyncRead` that a
/// real kernel hook writes records to.
pub type KernelEventStream = Box<dyn AsyncRead + Send + Unpin>;

/// The three streams §6 specifies, one per kernel event kind.
pub struct KernelEventStreams {
    pub open: KernelEventStream,
    pub data: KernelEventStream,
    pub close: KernelEventStream,
}

/// One decoded-record stream source, paired with the decoder for its wire
/// layout. `Open`/`Data`/`Close` each arrive on a distinct stream (§6), so
/// the task below reads all three concurrently rather than multiplexing a
/// tag byte.
pub struct KernelEventSource<O, D, C> {
    open: O,
    data: D,
    close: C,
    tracker: ConnectionTracker,
}

impl<O, D, C> KernelEventSource<O, D, C>
where
    O: AsyncRead + Unpin + Send + 'static,
    D: AsyncRead + Unpin + Send + 'static,
    C: AsyncRead + Unpin + Send + 'static,
{
    pub fn new(open: O, data: D, close: C, tracker: ConnectionTracker) -> Self {
        Self { open, data, close, tracker }
    }
}

impl KernelEventSource<KernelEventStream, KernelEventStream, KernelEventStream> {
    pub fn from_streams(streams: KernelEventStreams, tracker: ConnectionTracker) -> Self {
        Self::new(streams.open, streams.data, streams.close, tracker)
    }
}

#[async_trait]
impl<O, D, C> Task for KernelEventSource<O, D, C>
where
    O: AsyncRead + Unpin + Send + 'static,
    D: AsyncRead + Unpin + Send + 'static,
    C: AsyncRead + Unpin + Send + 'static,
{
    type Output = ();

    const NAME: &'static str = "kernel event source";

    async fn run(self, mut shutdown_signal: ShutdownSignal) -> Self::Output {
        let open = drain_stream(self.open, OPEN_RECORD_LEN, decode_open, self.tracker.clone(), "open");
        let data = drain_stream(self.data, DATA_RECORD_LEN, decode_data, self.tracker.clone(), "data");
        let close = drain_stream(self.close, CLOSE_RECORD_LEN, decode_close, self.tracker.clone(), "close");

        tokio::select! {
            _ = open => {}
            _ = data => {}
            _ = close => {}
            _ = shutdown_signal.wait() => {}
        }
    }
}

/// Reads fixed-size records off `reader` until a short read ends the
/// stream, decoding each with `decode` and applying it to `tracker`. Per
/// the wire format's own contract, a read that fails partway through a
/// record (including on `decode` itself) terminates this source only; it
/// never reaches the tracker as a record-level error.
async fn drain_stream<R>(mut reader: R, record_len: usize, decode: fn(&[u8]) -> Result<KernelEvent, DecodeError>, tracker: ConnectionTracker, name: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; record_len];
    loop {
        match reader.read_exact(&mut buf).await {
            Ok(_) => match decode(&buf) {
                Ok(event) => tracker.apply(event),
                Err(error) => {
                    debug!(source = name, %error, "malformed kernel event record, ending source");
                    return;
                }
            },
            Err(error) if error.kind() == std::io::ErrorKind::UnexpectedEof => {
                debug!(source = name, "kernel event source closed");
                return;
            }
            Err(error) => {
                debug!(source = name, %error, "kernel event source read failed");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
    use std::time::Duration;

    use tokio::io::AsyncWriteExt;

    use super::*;
    use crate::kernel_event::{ClockOffset, ConnectionId};

    fn open_record(timestamp_ns: u64, conn: ConnectionId, addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(addr) = addr else { panic!("ipv4 only") };
        let mut buf = Vec::with_capacity(OPEN_RECORD_LEN);
        buf.extend_from_slice(&timestamp_ns.to_le_bytes());
        buf.extend_from_slice(&conn.tgid.to_le_bytes());
        buf.extend_from_slice(&conn.fd.to_le_bytes());
        buf.extend_from_slice(&conn.tsid.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&addr.port().to_be_bytes());
        buf.extend_from_slice(&addr.ip().octets());
        buf.extend_from_slice(&[0u8; 8]);
        buf
    }

    #[tokio::test]
    async fn decoded_open_event_reaches_the_tracker() {
        let tracker = ConnectionTracker::new(usize::MAX, Duration::from_secs(60), ClockOffset::capture());
        let conn = ConnectionId { tgid: 1, fd: 2, tsid: 3 };
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(10, 0, 0, 1), 443));

        let (mut open_writer, open_reader) = tokio::io::duplex(4096);
        let (_data_writer, data_reader) = tokio::io::duplex(4096);
        let (_close_writer, close_reader) = tokio::io::duplex(4096);

        let source = KernelEventSource::new(open_reader, data_reader, close_reader, tracker.clone());
        let (shutdown, signal) = mimic_task::ShutdownHandle::new();
        let task = tokio::spawn(source.run(signal));

        open_writer.write_all(&open_record(1, conn, addr)).await.unwrap();
        drop(open_writer);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(tracker.sweep_once().is_empty(), "record is still open, never swept as complete");

        shutdown.signal();
        let _ = task.await;
    }
}

//! Binary decode of the kernel redirector's event wire formats (A4).
//!
//! All three layouts are little-endian and packed, with no framing beyond
//! `Data`'s `msgSize`-bounded payload. A truncated read terminates that
//! event source; it never reaches the tracker as a record-level error.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

pub const DATA_MSG_CAPACITY: usize = 16384;

/// Identifies a kernel-observed socket across its lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId {
    pub tgid: u32,
    pub fd: i32,
    pub tsid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Egress,
    Ingress,
}

#[derive(Debug, Clone)]
pub enum KernelEvent {
    Open {
        timestamp_ns: u64,
        conn: ConnectionId,
        addr: SocketAddr,
    },
    Data {
        timestamp_ns: u64,
        conn: ConnectionId,
        direction: Direction,
        msg: Vec<u8>,
    },
    Close {
        timestamp_ns: u64,
        conn: ConnectionId,
        written: i64,
        read: i64,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("truncated kernel event record")]
    Truncated,
    #[error("unrecognized direction tag {0}")]
    BadDirection(i32),
}

fn take<'a>(buf: &mut &'a [u8], n: usize) -> Result<&'a [u8], DecodeError> {
    if buf.len() < n {
        return Err(DecodeError::Truncated);
    }
    let (head, tail) = buf.split_at(n);
    *buf = tail;
    Ok(head)
}

fn read_u64(buf: &mut &[u8]) -> Result<u64, DecodeError> {
    Ok(u64::from_le_bytes(take(buf, 8)?.try_into().expect("exactly 8 bytes")))
}

fn read_u32(buf: &mut &[u8]) -> Result<u32, DecodeError> {
    Ok(u32::from_le_bytes(take(buf, 4)?.try_into().expect("exactly 4 bytes")))
}

fn read_i32(buf: &mut &[u8]) -> Result<i32, DecodeError> {
    Ok(i32::from_le_bytes(take(buf, 4)?.try_into().expect("exactly 4 bytes")))
}

fn read_i64(buf: &mut &[u8]) -> Result<i64, DecodeError> {
    Ok(i64::from_le_bytes(take(buf, 8)?.try_into().expect("exactly 8 bytes")))
}

fn read_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    Ok(u16::from_le_bytes(take(buf, 2)?.try_into().expect("exactly 2 bytes")))
}

fn read_connection_id(buf: &mut &[u8]) -> Result<ConnectionId, DecodeError> {
    let tgid = read_u32(buf)?;
    let fd = read_i32(buf)?;
    let tsid = read_u64(buf)?;
    Ok(ConnectionId { tgid, fd, tsid })
}

/// Decodes `SockAddrIn{u16 family; u16 port; u32 addr; [8]u8 zero}`.
///
/// `family` is read but not validated; the wire format only ever carries
/// IPv4 addresses here.
fn read_sock_addr_in(buf: &mut &[u8]) -> Result<SocketAddr, DecodeError> {
    let _family = read_u16(buf)?;
    let port = u16::from_be_bytes(take(buf, 2)?.try_into().expect("exactly 2 bytes"));
    let addr = take(buf, 4)?;
    let addr = Ipv4Addr::new(addr[0], addr[1], addr[2], addr[3]);
    let _zero = take(buf, 8)?;
    Ok(SocketAddr::V4(SocketAddrV4::new(addr, port)))
}

pub fn decode_open(mut buf: &[u8]) -> Result<KernelEvent, DecodeError> {
    let timestamp_ns = read_u64(&mut buf)?;
    let conn = read_connection_id(&mut buf)?;
    let addr = read_sock_addr_in(&mut buf)?;
    Ok(KernelEvent::Open {
        timestamp_ns,
        conn,
        addr,
    })
}

pub fn decode_data(mut buf: &[u8]) -> Result<KernelEvent, DecodeError> {
    let timestamp_ns = read_u64(&mut buf)?;
    let conn = read_connection_id(&mut buf)?;
    let direction = match read_i32(&mut buf)? {
        0 => Direction::Egress,
        1 => Direction::Ingress,
        other => return Err(DecodeError::BadDirection(other)),
    };
    let msg_size = read_u32(&mut buf)? as usize;
    let _pos = read_u64(&mut buf)?;
    let msg_buf = take(&mut buf, DATA_MSG_CAPACITY)?;
    let _validate_read = read_i64(&mut buf)?;
    let _validate_write = read_i64(&mut buf)?;

    let msg_size = msg_size.min(DATA_MSG_CAPACITY);
    let msg = msg_buf[..msg_size].to_vec();

    Ok(KernelEvent::Data {
        timestamp_ns,
        conn,
        direction,
        msg,
    })
}

pub fn decode_close(mut buf: &[u8]) -> Result<KernelEvent, DecodeError> {
    let timestamp_ns = read_u64(&mut buf)?;
    let conn = read_connection_id(&mut buf)?;
    let written = read_i64(&mut buf)?;
    let read = read_i64(&mut buf)?;
    Ok(KernelEvent::Close {
        timestamp_ns,
        conn,
        written,
        read,
    })
}

/// One-shot monotonic-to-wall-clock offset, read once at startup via
/// `(SystemTime::now(), Instant::now())` and applied to every subsequent
/// kernel timestamp field.
#[derive(Debug, Clone, Copy)]
pub struct ClockOffset {
    wall_at_start_ns: i128,
    monotonic_at_start: Instant,
}

impl ClockOffset {
    pub fn capture() -> Self {
        Self {
            wall_at_start_ns: UNIX_EPOCH
                .elapsed()
                .map(|d| i128::from(d.as_nanos()))
                .unwrap_or_default(),
            monotonic_at_start: Instant::now(),
        }
    }

    /// Converts a monotonic nanosecond timestamp captured by the kernel
    /// side into milliseconds since the Unix epoch.
    pub fn to_wall_clock_ms(&self, monotonic_ns: u64) -> i64 {
        let elapsed_ns = self.monotonic_at_start.elapsed().as_nanos() as i128;
        let now_mono_ns = elapsed_ns;
        let delta_ns = i128::from(monotonic_ns) - now_mono_ns;
        let wall_ns = self.wall_at_start_ns + delta_ns;
        (wall_ns / 1_000_000) as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_open_event() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&42u64.to_le_bytes());
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.extend_from_slice(&3i32.to_le_bytes());
        buf.extend_from_slice(&99u64.to_le_bytes());
        buf.extend_from_slice(&2u16.to_le_bytes());
        buf.extend_from_slice(&8080u16.to_be_bytes());
        buf.extend_from_slice(&[127, 0, 0, 1]);
        buf.extend_from_slice(&[0u8; 8]);

        let event = decode_open(&buf).expect("valid open event");
        match event {
            KernelEvent::Open { timestamp_ns, conn, addr } => {
                assert_eq!(timestamp_ns, 42);
                assert_eq!(conn, ConnectionId { tgid: 7, fd: 3, tsid: 99 });
                assert_eq!(addr, SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(127, 0, 0, 1), 8080)));
            }
            _ => panic!("expected Open"),
        }
    }

    #[test]
    fn truncated_open_is_an_error() {
        let buf = [0u8; 4];
        assert!(matches!(decode_open(&buf), Err(DecodeError::Truncated)));
    }

    #[test]
    fn decodes_data_event_respecting_msg_size() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes());
        buf.extend_from_slice(&1u64.to_le_bytes());
        buf.extend_from_slice(&1i32.to_le_bytes()); // ingress
        buf.extend_from_slice(&3u32.to_le_bytes()); // msg_size
        buf.extend_from_slice(&0u64.to_le_bytes()); // pos
        let mut msg = vec![b'h', b'i', b'!'];
        msg.resize(DATA_MSG_CAPACITY, 0);
        buf.extend_from_slice(&msg);
        buf.extend_from_slice(&0i64.to_le_bytes());
        buf.extend_from_slice(&0i64.to_le_bytes());

        let event = decode_data(&buf).expect("valid data event");
        match event {
            KernelEvent::Data { direction, msg, .. } => {
                assert_eq!(direction, Direction::Ingress);
                assert_eq!(msg, b"hi!");
            }
            _ => panic!("expected Data"),
        }
    }
}

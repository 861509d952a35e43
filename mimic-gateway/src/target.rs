//! Dial helper turning a resolved destination into a live TCP connection.
//!
//! Thin wrapper around `wire_addr::DestAddr`/`ToDestAddr`; the actual
//! connect is a plain `TcpStream::connect`, since this core never needs
//! TLS or SOCKS/CONNECT tunneling to reach the original destination.

use tokio::net::TcpStream;
use wire_addr::{DestAddr, ToDestAddr};

use crate::resolver::DestinationInfo;

impl DestinationInfo {
    pub fn to_dest_addr(self) -> DestAddr {
        DestAddr::Ip(std::net::SocketAddr::new(self.addr, self.port))
    }
}

pub async fn dial(dest: &DestAddr) -> std::io::Result<TcpStream> {
    match dest {
        DestAddr::Ip(addr) => TcpStream::connect(addr).await,
        DestAddr::Domain(host, port) => TcpStream::connect((host.as_str(), *port)).await,
    }
}

/// Convenience for anything that can be turned into a `DestAddr`
/// (sockets, domain/port pairs, strings).
pub async fn dial_to<T: ToDestAddr>(target: T) -> std::io::Result<TcpStream> {
    let dest = target.to_dest_addr()?;
    dial(&dest).await
}

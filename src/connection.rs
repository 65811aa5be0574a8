//! Server address parsing and TCP connection establishment.

use std::io;
use std::net::SocketAddr;

use tokio::net::{lookup_host, TcpSocket, TcpStream};

use crate::Error;

const DEFAULT_PORT: u16 = 11211;

/// Normalizes a server DSN into the `host:port` form used both to connect
/// and as the node's identity on the hash ring.
///
/// Accepts `tcp://host[:port]` or a bare `host[:port]`; the port defaults to
/// 11211.
pub(crate) fn normalize_addr(dsn: &str) -> Result<String, Error> {
    if let Ok(url) = url::Url::parse(dsn) {
        if url.scheme() == "tcp" {
            let host = url.host_str().ok_or_else(|| {
                Error::Io(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "no host found in DSN",
                ))
            })?;
            return Ok(format!("{}:{}", host, url.port().unwrap_or(DEFAULT_PORT)));
        }
        // A bare `host:port` parses as a URL with `host` as its scheme; fall
        // through and treat the DSN as a plain address.
    }

    if dsn.is_empty() {
        return Err(Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "empty server address",
        )));
    }
    if dsn.contains(':') {
        Ok(dsn.to_string())
    } else {
        Ok(format!("{}:{}", dsn, DEFAULT_PORT))
    }
}

/// Connects to `addr`, trying every resolved address in order.
pub(crate) async fn connect(addr: String) -> io::Result<TcpStream> {
    let addrs = lookup_host(&addr).await?.collect::<Vec<SocketAddr>>();

    let mut last_err = None;

    for sa in addrs {
        let socket = if sa.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_nodelay(true)?;
        match socket.connect(sa).await {
            Ok(stream) => return Ok(stream),
            Err(e) => last_err = Some(e),
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        )
    }))
}

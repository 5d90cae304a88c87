use std::net::{IpAddr, SocketAddr};

use crate::error::{Error, ErrorKind, Result};

/// Parses the address of a peer.
///
/// Accepted forms are `[v6]:port`, `v4:port`, or a bare IPv4 or IPv6
/// address, which is then paired with `default_port`.
///
/// # Errors
///
/// Returns an [`ErrorKind::Address`] error when `input` is none of the
/// accepted forms.
pub fn parse_endpoint(input: &str, default_port: u16) -> Result<SocketAddr> {
    let input = input.trim();

    if let Ok(address) = input.parse::<SocketAddr>() {
        return Ok(address);
    }

    // A bare IPv6 address between brackets.
    let bare = input
        .strip_prefix('[')
        .and_then(|inner| inner.strip_suffix(']'))
        .unwrap_or(input);

    bare.parse::<IpAddr>()
        .map(|ip| SocketAddr::new(ip, default_port))
        .map_err(|e| {
            Error::new(
                ErrorKind::Address,
                format!("Invalid peer address `{input}`: {e}"),
            )
        })
}

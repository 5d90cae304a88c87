use std::future::Future;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tokio::net::UdpSocket;

use tracing::debug;

use iotnode::Messenger;

use crate::error::{Error, Result};

use super::message::{Code, ContentFormat, Message, MessageType};

/// A `CoAP` client posting text payloads to one fixed peer.
///
/// Requests are non-confirmable: the client never waits for a response, and
/// a lost datagram is only noticed through the missing data point.
#[derive(Debug)]
pub struct CoapClient {
    socket: UdpSocket,
    peer: SocketAddr,
    message_id: AtomicU16,
}

impl CoapClient {
    /// Creates a [`CoapClient`] sending requests to `peer`.
    ///
    /// The local socket is bound to an ephemeral port of the same address
    /// family as `peer`.
    ///
    /// # Errors
    ///
    /// Fails when the local socket cannot be bound.
    pub async fn bind(peer: SocketAddr) -> Result<Self> {
        let local = if peer.is_ipv4() {
            SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
        } else {
            SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
        };

        let socket = UdpSocket::bind(local).await?;
        debug!(
            "CoAP client bound to {}, peer {peer}",
            socket.local_addr()?
        );

        Ok(Self {
            socket,
            peer,
            message_id: AtomicU16::new(initial_message_id()),
        })
    }

    /// Returns the peer address.
    #[must_use]
    pub const fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Posts `payload` to the resource at `path` of the peer.
    ///
    /// # Errors
    ///
    /// Fails when the message cannot be encoded or sent.
    pub async fn post(&self, path: &str, payload: &[u8]) -> Result<()> {
        let message_id = self.message_id.fetch_add(1, Ordering::Relaxed);

        let message = Message::new(MessageType::NonConfirmable, Code::POST, message_id)
            .with_token(&message_id.to_be_bytes())
            .with_path(path)
            .with_content_format(ContentFormat::TEXT)
            .with_payload(payload);

        let bytes = message.encode()?;
        let _ = self.socket.send_to(&bytes, self.peer).await?;

        debug!("Posted {} bytes to {}{path}", payload.len(), self.peer);

        Ok(())
    }
}

impl Messenger for CoapClient {
    type Error = Error;

    fn send(
        &self,
        destination: &str,
        payload: &[u8],
    ) -> impl Future<Output = std::result::Result<(), Self::Error>> + Send {
        self.post(destination, payload)
    }
}

// Message identifiers should not start from the same value at each boot.
fn initial_message_id() -> u16 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| (elapsed.subsec_nanos() >> 8) as u16)
        .unwrap_or_default()
}

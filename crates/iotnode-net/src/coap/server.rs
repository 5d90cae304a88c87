use std::future::Future;
use std::net::SocketAddr;
use std::pin::Pin;

use indexmap::IndexMap;

use tokio::net::UdpSocket;

use tokio_util::sync::CancellationToken;

use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::node::NodeInfo;

use super::message::{Code, ContentFormat, Message, MessageType};

// Largest datagram accepted by the server.
const MAX_MESSAGE_SIZE: usize = 1152;

const WELL_KNOWN_CORE: &str = "/.well-known/core";

/// The future returned by a resource handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response> + Send>>;

type Handler = Box<dyn Fn(Request) -> HandlerFuture + Send + Sync>;

/// A request received by the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Request method.
    pub method: Code,
    /// Resource path, starting with `/`.
    pub path: String,
    /// Request payload.
    pub payload: Vec<u8>,
    /// Address of the client.
    pub source: SocketAddr,
}

impl Request {
    /// Returns the payload as text, if it is valid UTF-8.
    #[must_use]
    pub fn text(&self) -> Option<&str> {
        std::str::from_utf8(&self.payload).ok()
    }
}

/// The answer of a resource handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    /// Response code.
    pub code: Code,
    /// Payload format.
    pub content_format: Option<ContentFormat>,
    /// Response payload.
    pub payload: Vec<u8>,
}

impl Response {
    /// Creates a [`Response`] without payload.
    #[must_use]
    pub const fn new(code: Code) -> Self {
        Self {
            code,
            content_format: None,
            payload: Vec::new(),
        }
    }

    /// Creates a `2.05 Content` response carrying text.
    #[must_use]
    pub fn text(payload: impl Into<String>) -> Self {
        Self::with_format(Code::CONTENT, ContentFormat::TEXT, payload.into())
    }

    /// Creates a `2.05 Content` response carrying `JSON`.
    #[must_use]
    pub fn json(payload: impl Into<String>) -> Self {
        Self::with_format(Code::CONTENT, ContentFormat::JSON, payload.into())
    }

    /// Creates a `2.04 Changed` response.
    #[must_use]
    pub const fn changed() -> Self {
        Self::new(Code::CHANGED)
    }

    /// Creates a `4.00 Bad Request` response explaining the problem.
    #[must_use]
    pub fn bad_request(reason: impl Into<String>) -> Self {
        Self::with_format(Code::BAD_REQUEST, ContentFormat::TEXT, reason.into())
    }

    fn with_format(code: Code, format: ContentFormat, payload: String) -> Self {
        Self {
            code,
            content_format: Some(format),
            payload: payload.into_bytes(),
        }
    }
}

/// A `CoAP` resource server.
///
/// Requests are served one at a time, in arrival order. Unknown resources
/// are answered with `4.04`, unsupported methods with `4.05`.
/// Resources are listed in link format under `/.well-known/core`.
pub struct CoapServer {
    socket: UdpSocket,
    routes: IndexMap<String, Vec<(Code, Handler)>>,
    message_id: u16,
}

impl CoapServer {
    /// Creates a [`CoapServer`] listening on `address`.
    ///
    /// # Errors
    ///
    /// Fails when the socket cannot be bound.
    pub async fn bind(address: SocketAddr) -> Result<Self> {
        let socket = UdpSocket::bind(address).await?;
        Ok(Self {
            socket,
            routes: IndexMap::new(),
            message_id: 0,
        })
    }

    /// Returns the address the server is listening on.
    ///
    /// # Errors
    ///
    /// Fails when the socket address cannot be retrieved.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Adds a handler for `method` requests on `path`.
    #[must_use]
    pub fn route<F, Fut>(mut self, method: Code, path: &str, handler: F) -> Self
    where
        F: Fn(Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Response> + Send + 'static,
    {
        let path = if path.starts_with('/') {
            path.to_owned()
        } else {
            format!("/{path}")
        };

        self.routes
            .entry(path)
            .or_default()
            .push((method, Box::new(move |request| Box::pin(handler(request)))));
        self
    }

    /// Adds a read-only text resource.
    #[must_use]
    pub fn text_resource(self, path: &str, value: impl Into<String>) -> Self {
        let value = value.into();
        self.route(Code::GET, path, move |_| {
            let response = Response::text(value.clone());
            async move { response }
        })
    }

    /// Adds the resources describing the node: `/name`, `/board`, `/mcu`,
    /// `/os`, `/position`, `/version`, and `/appid`.
    ///
    /// # Errors
    ///
    /// Fails when the node position cannot be serialized.
    pub fn node_resources(self, info: &NodeInfo) -> Result<Self> {
        let position = serde_json::to_string(&info.position)?;

        Ok(self
            .text_resource("name", info.name.clone())
            .text_resource("board", info.board.clone())
            .text_resource("mcu", info.mcu.clone())
            .text_resource("os", info.os.clone())
            .text_resource("position", position)
            .text_resource("version", info.version.clone())
            .text_resource("appid", info.app_id.clone()))
    }

    /// Returns the paths of all resources, in registration order.
    pub fn resources(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// Serves requests until `cancellation_token` is cancelled.
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        match self.socket.local_addr() {
            Ok(address) => info!("CoAP server listening on {address}"),
            Err(e) => warn!("CoAP server address unavailable: {e}"),
        }

        let mut buf = vec![0u8; MAX_MESSAGE_SIZE];
        loop {
            tokio::select! {
                // Use the cancellation token to stop the loop
                () = cancellation_token.cancelled() => { break; }
                received = self.socket.recv_from(&mut buf) => {
                    let (len, source) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            warn!("Error in receiving a request, discard it: {e}");
                            continue;
                        }
                    };

                    let request = match Message::decode(&buf[..len]) {
                        Ok(request) => request,
                        Err(e) => {
                            warn!("Malformed message from {source}, discard it: {e}");
                            continue;
                        }
                    };

                    let Some(response) = self.handle(request, source).await else {
                        continue;
                    };

                    self.reply(&response, source).await;
                }
            }
        }

        info!("CoAP server stopped");
    }

    async fn reply(&self, response: &Message, destination: SocketAddr) {
        let bytes = match response.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!("Impossible to encode the response for {destination}: {e}");
                return;
            }
        };

        if let Err(e) = self.socket.send_to(&bytes, destination).await {
            warn!("Impossible to reply to {destination}: {e}");
        }
    }

    async fn handle(&mut self, request: Message, source: SocketAddr) -> Option<Message> {
        match request.kind {
            MessageType::Acknowledgement | MessageType::Reset => return None,
            MessageType::Confirmable | MessageType::NonConfirmable => {}
        }

        // A confirmable empty message is a ping.
        if request.code == Code::EMPTY {
            return (request.kind == MessageType::Confirmable)
                .then(|| Message::new(MessageType::Reset, Code::EMPTY, request.message_id));
        }

        if !request.code.is_request() {
            debug!("Ignoring {} message from {source}", request.code);
            return None;
        }

        let path = request.path();
        debug!("{} {path} from {source}", request.code);

        let response = self
            .respond(Request {
                method: request.code,
                path,
                payload: request.payload,
                source,
            })
            .await;

        let (kind, message_id) = if request.kind == MessageType::Confirmable {
            (MessageType::Acknowledgement, request.message_id)
        } else {
            self.message_id = self.message_id.wrapping_add(1);
            (MessageType::NonConfirmable, self.message_id)
        };

        let mut message = Message::new(kind, response.code, message_id)
            .with_token(&request.token)
            .with_payload(response.payload);
        if let Some(format) = response.content_format {
            message = message.with_content_format(format);
        }

        Some(message)
    }

    async fn respond(&self, request: Request) -> Response {
        let Some(handlers) = self.routes.get(&request.path) else {
            if request.path == WELL_KNOWN_CORE && request.method == Code::GET {
                return self.link_format();
            }
            return Response::new(Code::NOT_FOUND);
        };

        let Some((_, handler)) = handlers.iter().find(|(method, _)| *method == request.method)
        else {
            return Response::new(Code::METHOD_NOT_ALLOWED);
        };

        handler(request).await
    }

    fn link_format(&self) -> Response {
        let links = self
            .resources()
            .map(|path| format!("<{path}>"))
            .collect::<Vec<_>>()
            .join(",");

        Response {
            code: Code::CONTENT,
            content_format: Some(ContentFormat::LINK_FORMAT),
            payload: links.into_bytes(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    use tokio::net::UdpSocket;

    use tokio_util::sync::CancellationToken;

    use crate::coap::{Code, ContentFormat, Message, MessageType};
    use crate::node::NodeInfo;

    use super::{CoapServer, Response};

    fn localhost() -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, 0))
    }

    async fn led_server(led: &Arc<AtomicBool>) -> CoapServer {
        let get_led = Arc::clone(led);
        let put_led = Arc::clone(led);

        CoapServer::bind(localhost())
            .await
            .unwrap()
            .route(Code::GET, "/led", move |_| {
                let on = get_led.load(Ordering::SeqCst);
                async move { Response::text(if on { "1" } else { "0" }) }
            })
            .route(Code::PUT, "led", move |request| {
                let led = Arc::clone(&put_led);
                async move {
                    match request.text() {
                        Some("1") => led.store(true, Ordering::SeqCst),
                        Some("0") => led.store(false, Ordering::SeqCst),
                        _ => return Response::bad_request("Expected 0 or 1"),
                    }
                    Response::changed()
                }
            })
    }

    fn request(kind: MessageType, code: Code, path: &str) -> Message {
        Message::new(kind, code, 0x0A0B)
            .with_token(&[0xCA, 0xFE])
            .with_path(path)
    }

    #[tokio::test]
    async fn routing() {
        let led = Arc::new(AtomicBool::new(false));
        let mut server = led_server(&led).await;
        let source = localhost();

        let response = server
            .handle(
                request(MessageType::Confirmable, Code::PUT, "/led").with_payload("1"),
                source,
            )
            .await
            .unwrap();
        assert_eq!(response.code, Code::CHANGED);
        assert_eq!(response.kind, MessageType::Acknowledgement);
        assert_eq!(response.message_id, 0x0A0B);
        assert_eq!(response.token, [0xCA, 0xFE]);
        assert!(led.load(Ordering::SeqCst));

        let response = server
            .handle(request(MessageType::Confirmable, Code::GET, "/led"), source)
            .await
            .unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"1");
        assert_eq!(response.content_format(), Some(ContentFormat::TEXT));

        let response = server
            .handle(
                request(MessageType::Confirmable, Code::PUT, "/led").with_payload("on"),
                source,
            )
            .await
            .unwrap();
        assert_eq!(response.code, Code::BAD_REQUEST);
        assert!(led.load(Ordering::SeqCst));

        let response = server
            .handle(request(MessageType::Confirmable, Code::DELETE, "/led"), source)
            .await
            .unwrap();
        assert_eq!(response.code, Code::METHOD_NOT_ALLOWED);

        let response = server
            .handle(request(MessageType::Confirmable, Code::GET, "/temperature"), source)
            .await
            .unwrap();
        assert_eq!(response.code, Code::NOT_FOUND);
    }

    #[tokio::test]
    async fn message_types() {
        let led = Arc::new(AtomicBool::new(false));
        let mut server = led_server(&led).await;
        let source = localhost();

        let response = server
            .handle(request(MessageType::NonConfirmable, Code::GET, "/led"), source)
            .await
            .unwrap();
        assert_eq!(response.kind, MessageType::NonConfirmable);
        assert_eq!(response.token, [0xCA, 0xFE]);

        let ping = Message::new(MessageType::Confirmable, Code::EMPTY, 42);
        let pong = server.handle(ping, source).await.unwrap();
        assert_eq!(pong.kind, MessageType::Reset);
        assert_eq!(pong.message_id, 42);

        let ack = Message::new(MessageType::Acknowledgement, Code::EMPTY, 42);
        assert!(server.handle(ack, source).await.is_none());

        let stray = request(MessageType::NonConfirmable, Code::CONTENT, "/led");
        assert!(server.handle(stray, source).await.is_none());
    }

    #[tokio::test]
    async fn node_resources() {
        let info = NodeInfo::new("node_id_0");
        let mut server = CoapServer::bind(localhost())
            .await
            .unwrap()
            .node_resources(&info)
            .unwrap();

        assert_eq!(
            server.resources().collect::<Vec<_>>(),
            [
                "/name",
                "/board",
                "/mcu",
                "/os",
                "/position",
                "/version",
                "/appid"
            ]
        );

        let response = server
            .handle(
                request(MessageType::Confirmable, Code::GET, "/position"),
                localhost(),
            )
            .await
            .unwrap();
        assert_eq!(response.payload, br#"{"lat":48.714784,"lng":2.205502}"#);

        let response = server
            .handle(
                request(MessageType::Confirmable, Code::GET, "/.well-known/core"),
                localhost(),
            )
            .await
            .unwrap();
        assert_eq!(response.content_format(), Some(ContentFormat::LINK_FORMAT));
        assert!(
            String::from_utf8(response.payload)
                .unwrap()
                .starts_with("</name>,</board>,</mcu>")
        );
    }

    #[tokio::test]
    async fn serve_over_udp() {
        let led = Arc::new(AtomicBool::new(true));
        let server = led_server(&led).await;
        let address = server.local_addr().unwrap();

        let cancellation_token = CancellationToken::new();
        let task = tokio::spawn(server.run(cancellation_token.clone()));

        let client = UdpSocket::bind(localhost()).await.unwrap();
        let bytes = request(MessageType::Confirmable, Code::GET, "/led")
            .encode()
            .unwrap();
        let _ = client.send_to(&bytes, address).await.unwrap();

        // Malformed datagrams are discarded without stopping the server.
        let _ = client.send_to(&[0xFF], address).await.unwrap();

        let mut buf = [0u8; 128];
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let response = Message::decode(&buf[..len]).unwrap();
        assert_eq!(response.code, Code::CONTENT);
        assert_eq!(response.payload, b"1");

        let bytes = request(MessageType::Confirmable, Code::GET, "/missing")
            .encode()
            .unwrap();
        let _ = client.send_to(&bytes, address).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(Message::decode(&buf[..len]).unwrap().code, Code::NOT_FOUND);

        cancellation_token.cancel();
        task.await.unwrap();
    }
}

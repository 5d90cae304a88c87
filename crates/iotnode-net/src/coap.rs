mod client;
mod message;
mod server;

pub use client::CoapClient;
pub use message::{Code, ContentFormat, Message, MessageType, option};
pub use server::{CoapServer, HandlerFuture, Request, Response};

/// Default `CoAP` port.
pub const DEFAULT_PORT: u16 = 5683;

use bytes::{BufMut, Bytes, BytesMut};

use crate::error::{Error, ErrorKind, Result};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;
const MAX_TOKEN_LENGTH: usize = 8;
const HEADER_LENGTH: usize = 4;

// Option delta and length nibbles announcing extended values.
const EXTENDED_ONE_BYTE: u8 = 13;
const EXTENDED_TWO_BYTES: u8 = 14;
const RESERVED: u8 = 15;
const ONE_BYTE_OFFSET: usize = 13;
const TWO_BYTES_OFFSET: usize = 269;

/// Option numbers understood by the node.
pub mod option {
    /// One segment of the resource path.
    pub const URI_PATH: u16 = 11;
    /// Representation format of the payload.
    pub const CONTENT_FORMAT: u16 = 12;
}

/// Message types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    /// Requires an acknowledgement.
    Confirmable = 0,
    /// Does not require an acknowledgement.
    NonConfirmable = 1,
    /// Acknowledges a confirmable message.
    Acknowledgement = 2,
    /// Rejects a message which cannot be processed.
    Reset = 3,
}

impl MessageType {
    const fn from_bits(bits: u8) -> Self {
        match bits & 0x03 {
            0 => Self::Confirmable,
            1 => Self::NonConfirmable,
            2 => Self::Acknowledgement,
            _ => Self::Reset,
        }
    }
}

/// A request method or a response code, as `class.detail`.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(u8);

impl Code {
    /// `0.00`, an empty message.
    pub const EMPTY: Self = Self::new(0, 0);
    /// `0.01`
    pub const GET: Self = Self::new(0, 1);
    /// `0.02`
    pub const POST: Self = Self::new(0, 2);
    /// `0.03`
    pub const PUT: Self = Self::new(0, 3);
    /// `0.04`
    pub const DELETE: Self = Self::new(0, 4);
    /// `2.01`
    pub const CREATED: Self = Self::new(2, 1);
    /// `2.04`
    pub const CHANGED: Self = Self::new(2, 4);
    /// `2.05`
    pub const CONTENT: Self = Self::new(2, 5);
    /// `4.00`
    pub const BAD_REQUEST: Self = Self::new(4, 0);
    /// `4.04`
    pub const NOT_FOUND: Self = Self::new(4, 4);
    /// `4.05`
    pub const METHOD_NOT_ALLOWED: Self = Self::new(4, 5);
    /// `5.00`
    pub const INTERNAL_SERVER_ERROR: Self = Self::new(5, 0);

    /// Creates a [`Code`] from its class and detail.
    #[must_use]
    pub const fn new(class: u8, detail: u8) -> Self {
        Self(((class & 0x07) << 5) | (detail & 0x1F))
    }

    /// Returns the code class.
    #[must_use]
    pub const fn class(self) -> u8 {
        self.0 >> 5
    }

    /// Returns the code detail.
    #[must_use]
    pub const fn detail(self) -> u8 {
        self.0 & 0x1F
    }

    /// Checks whether the code is a request method.
    #[must_use]
    pub const fn is_request(self) -> bool {
        self.class() == 0 && self.detail() != 0
    }
}

impl std::fmt::Display for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

impl std::fmt::Debug for Code {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Content formats used by the node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentFormat(pub u16);

impl ContentFormat {
    /// `text/plain; charset=utf-8`
    pub const TEXT: Self = Self(0);
    /// `application/link-format`
    pub const LINK_FORMAT: Self = Self(40);
    /// `application/json`
    pub const JSON: Self = Self(50);
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct CoapOption {
    number: u16,
    value: Vec<u8>,
}

/// A `CoAP` message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Message type.
    pub kind: MessageType,
    /// Request method or response code.
    pub code: Code,
    /// Identifier used to detect duplicates and match acknowledgements.
    pub message_id: u16,
    /// Token used to match a response with its request.
    pub token: Vec<u8>,
    /// Message payload.
    pub payload: Vec<u8>,
    options: Vec<CoapOption>,
}

impl Message {
    /// Creates an empty [`Message`].
    #[must_use]
    pub const fn new(kind: MessageType, code: Code, message_id: u16) -> Self {
        Self {
            kind,
            code,
            message_id,
            token: Vec::new(),
            payload: Vec::new(),
            options: Vec::new(),
        }
    }

    /// Sets the token.
    #[must_use]
    pub fn with_token(mut self, token: &[u8]) -> Self {
        self.token = token.to_vec();
        self
    }

    /// Appends one `Uri-Path` option for each segment of `path`.
    #[must_use]
    pub fn with_path(mut self, path: &str) -> Self {
        for segment in path.split('/').filter(|segment| !segment.is_empty()) {
            self.options.push(CoapOption {
                number: option::URI_PATH,
                value: segment.as_bytes().to_vec(),
            });
        }
        self
    }

    /// Sets the `Content-Format` option.
    #[must_use]
    pub fn with_content_format(mut self, format: ContentFormat) -> Self {
        self.options
            .retain(|option| option.number != option::CONTENT_FORMAT);
        self.options.push(CoapOption {
            number: option::CONTENT_FORMAT,
            value: encode_uint(format.0),
        });
        self
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: impl Into<Vec<u8>>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Returns the values of the options with the given number, in order.
    pub fn options(&self, number: u16) -> impl Iterator<Item = &[u8]> {
        self.options
            .iter()
            .filter(move |option| option.number == number)
            .map(|option| option.value.as_slice())
    }

    /// Returns the resource path built from the `Uri-Path` options.
    ///
    /// The path always starts with `/`.
    #[must_use]
    pub fn path(&self) -> String {
        let mut path = String::new();
        for segment in self.options(option::URI_PATH) {
            path.push('/');
            path.push_str(&String::from_utf8_lossy(segment));
        }

        if path.is_empty() {
            path.push('/');
        }
        path
    }

    /// Returns the `Content-Format` option, if any.
    #[must_use]
    pub fn content_format(&self) -> Option<ContentFormat> {
        self.options(option::CONTENT_FORMAT)
            .next()
            .map(|value| ContentFormat(decode_uint(value)))
    }

    /// Encodes the message into its wire format.
    ///
    /// # Errors
    ///
    /// Fails when the token is longer than 8 bytes, or an option value is
    /// too long to be encoded.
    pub fn encode(&self) -> Result<Bytes> {
        if self.token.len() > MAX_TOKEN_LENGTH {
            return Err(Error::new(
                ErrorKind::Coap,
                format!("Token of {} bytes, at most 8 allowed", self.token.len()),
            ));
        }

        let mut buf = BytesMut::with_capacity(HEADER_LENGTH + self.token.len() + self.payload.len());

        // The token length is at most 8, which fits the 4 bits of the header.
        buf.put_u8((VERSION << 6) | ((self.kind as u8) << 4) | self.token.len() as u8);
        buf.put_u8(self.code.0);
        buf.put_u16(self.message_id);
        buf.put_slice(&self.token);

        // Options must be encoded by increasing number.
        let mut options: Vec<&CoapOption> = self.options.iter().collect();
        options.sort_by_key(|option| option.number);

        let mut previous = 0;
        for option in options {
            let delta = usize::from(option.number - previous);
            let length = option.value.len();

            let (delta_nibble, delta_extended) = split_extended(delta)?;
            let (length_nibble, length_extended) = split_extended(length)?;

            buf.put_u8((delta_nibble << 4) | length_nibble);
            buf.put_slice(&delta_extended);
            buf.put_slice(&length_extended);
            buf.put_slice(&option.value);

            previous = option.number;
        }

        if !self.payload.is_empty() {
            buf.put_u8(PAYLOAD_MARKER);
            buf.put_slice(&self.payload);
        }

        Ok(buf.freeze())
    }

    /// Decodes a message from its wire format.
    ///
    /// # Errors
    ///
    /// Fails when the data is not a well-formed `CoAP` message.
    pub fn decode(data: &[u8]) -> Result<Self> {
        let mut reader = Reader { data, position: 0 };

        let header = reader.take(HEADER_LENGTH)?;
        let version = header[0] >> 6;
        if version != VERSION {
            return Err(malformed(format!("Unsupported version {version}")));
        }

        let token_length = usize::from(header[0] & 0x0F);
        if token_length > MAX_TOKEN_LENGTH {
            return Err(malformed(format!("Token length {token_length}")));
        }

        let mut message = Self::new(
            MessageType::from_bits(header[0] >> 4),
            Code(header[1]),
            u16::from_be_bytes([header[2], header[3]]),
        );
        message.token = reader.take(token_length)?.to_vec();

        let mut number: u16 = 0;
        while let Some(byte) = reader.next_byte() {
            if byte == PAYLOAD_MARKER {
                let payload = reader.rest();
                if payload.is_empty() {
                    return Err(malformed("Payload marker without payload"));
                }
                message.payload = payload.to_vec();
                break;
            }

            let delta = reader.extended(byte >> 4)?;
            let length = reader.extended(byte & 0x0F)?;

            number = u16::try_from(delta)
                .ok()
                .and_then(|delta| number.checked_add(delta))
                .ok_or_else(|| malformed("Option number overflow"))?;

            message.options.push(CoapOption {
                number,
                value: reader.take(length)?.to_vec(),
            });
        }

        Ok(message)
    }
}

struct Reader<'a> {
    data: &'a [u8],
    position: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, length: usize) -> Result<&'a [u8]> {
        let end = self.position + length;
        let slice = self
            .data
            .get(self.position..end)
            .ok_or_else(|| malformed("Truncated message"))?;
        self.position = end;
        Ok(slice)
    }

    fn next_byte(&mut self) -> Option<u8> {
        let byte = self.data.get(self.position).copied()?;
        self.position += 1;
        Some(byte)
    }

    fn rest(&mut self) -> &'a [u8] {
        let rest = &self.data[self.position..];
        self.position = self.data.len();
        rest
    }

    fn extended(&mut self, nibble: u8) -> Result<usize> {
        match nibble {
            EXTENDED_ONE_BYTE => Ok(usize::from(self.take(1)?[0]) + ONE_BYTE_OFFSET),
            EXTENDED_TWO_BYTES => {
                let bytes = self.take(2)?;
                Ok(usize::from(u16::from_be_bytes([bytes[0], bytes[1]])) + TWO_BYTES_OFFSET)
            }
            RESERVED => Err(malformed("Reserved option nibble")),
            value => Ok(usize::from(value)),
        }
    }
}

fn split_extended(value: usize) -> Result<(u8, Vec<u8>)> {
    if value < ONE_BYTE_OFFSET {
        // Lower than 13, it fits the nibble.
        Ok((value as u8, Vec::new()))
    } else if value < TWO_BYTES_OFFSET {
        Ok((EXTENDED_ONE_BYTE, vec![(value - ONE_BYTE_OFFSET) as u8]))
    } else {
        let extended = u16::try_from(value - TWO_BYTES_OFFSET).map_err(|_| {
            Error::new(
                ErrorKind::Coap,
                format!("Option value of {value} bytes is too long"),
            )
        })?;
        Ok((EXTENDED_TWO_BYTES, extended.to_be_bytes().to_vec()))
    }
}

fn encode_uint(value: u16) -> Vec<u8> {
    match value {
        0 => Vec::new(),
        1..=0xFF => vec![value as u8],
        _ => value.to_be_bytes().to_vec(),
    }
}

fn decode_uint(bytes: &[u8]) -> u16 {
    bytes
        .iter()
        .fold(0u16, |value, byte| (value << 8) | u16::from(*byte))
}

fn malformed(description: impl Into<std::borrow::Cow<'static, str>>) -> Error {
    Error::new(ErrorKind::Coap, description)
}

#[cfg(test)]
mod tests {
    use crate::error::ErrorKind;

    use super::{Code, ContentFormat, Message, MessageType, option};

    #[test]
    fn code_display() {
        assert_eq!(Code::CONTENT.to_string(), "2.05");
        assert_eq!(Code::METHOD_NOT_ALLOWED.to_string(), "4.05");
        assert!(Code::POST.is_request());
        assert!(!Code::EMPTY.is_request());
        assert!(!Code::CHANGED.is_request());
    }

    #[test]
    fn encode_post() {
        let message = Message::new(MessageType::NonConfirmable, Code::POST, 0x1234)
            .with_token(&[0xAB])
            .with_path("/alive")
            .with_content_format(ContentFormat::TEXT)
            .with_payload("alive:01");

        let bytes = message.encode().unwrap();

        let mut expected = vec![0x51, 0x02, 0x12, 0x34, 0xAB];
        // Uri-Path, delta 11, length 5.
        expected.extend_from_slice(&[0xB5]);
        expected.extend_from_slice(b"alive");
        // Content-Format, delta 1, empty value for text.
        expected.push(0x10);
        expected.push(0xFF);
        expected.extend_from_slice(b"alive:01");

        assert_eq!(bytes.as_ref(), expected.as_slice());
    }

    #[test]
    fn decode_preserves_fields() {
        let message = Message::new(MessageType::Confirmable, Code::PUT, 7)
            .with_token(&[1, 2, 3, 4, 5, 6, 7, 8])
            .with_path("/sensors/light/extended-resource-name")
            .with_content_format(ContentFormat::JSON)
            .with_payload(vec![b'x'; 300]);

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();

        assert_eq!(decoded.kind, MessageType::Confirmable);
        assert_eq!(decoded.code, Code::PUT);
        assert_eq!(decoded.message_id, 7);
        assert_eq!(decoded.token, [1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(decoded.path(), "/sensors/light/extended-resource-name");
        assert_eq!(decoded.content_format(), Some(ContentFormat::JSON));
        assert_eq!(decoded.payload.len(), 300);
        assert_eq!(decoded, message);
    }

    #[test]
    fn long_option_values() {
        let segment = "s".repeat(400);
        let message =
            Message::new(MessageType::NonConfirmable, Code::GET, 1).with_path(&segment);

        let decoded = Message::decode(&message.encode().unwrap()).unwrap();
        assert_eq!(decoded.path(), format!("/{segment}"));
        assert_eq!(decoded.options(option::URI_PATH).count(), 1);
    }

    #[test]
    fn empty_path() {
        let message = Message::new(MessageType::Confirmable, Code::GET, 1);
        assert_eq!(message.path(), "/");
        assert_eq!(message.content_format(), None);
    }

    #[test]
    fn malformed_messages() {
        let truncated: &[u8] = &[0x40, 0x01];
        let bad_version: &[u8] = &[0x80, 0x01, 0x00, 0x01];
        let long_token: &[u8] = &[0x49, 0x01, 0x00, 0x01];
        let missing_token: &[u8] = &[0x42, 0x01, 0x00, 0x01, 0xAA];
        let empty_payload: &[u8] = &[0x40, 0x01, 0x00, 0x01, 0xFF];
        let reserved_nibble: &[u8] = &[0x40, 0x01, 0x00, 0x01, 0xF1, 0x00];
        let truncated_option: &[u8] = &[0x40, 0x01, 0x00, 0x01, 0xB5, b'a'];

        for data in [
            truncated,
            bad_version,
            long_token,
            missing_token,
            empty_payload,
            reserved_nibble,
            truncated_option,
        ] {
            assert_eq!(
                Message::decode(data).unwrap_err().kind(),
                ErrorKind::Coap,
                "{data:x?}"
            );
        }
    }

    #[test]
    fn token_too_long() {
        let message =
            Message::new(MessageType::Confirmable, Code::GET, 1).with_token(&[0; 9]);
        assert_eq!(message.encode().unwrap_err().kind(), ErrorKind::Coap);
    }
}

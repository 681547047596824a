use std::fmt;

use bytes::Bytes;
use rand::Rng;

use crate::core::{Error, Result};

/// CoAP option numbers used by this stack
pub mod option {
    pub const URI_PATH: u16 = 11;
    pub const CONTENT_FORMAT: u16 = 12;
    pub const BLOCK2: u16 = 23;
}

/// Content-Format registry values
pub mod content_format {
    pub const TEXT_PLAIN: u16 = 0;
    pub const LINK_FORMAT: u16 = 40;
    pub const JSON: u16 = 50;
}

/// Maximum token length allowed by the header
pub const MAX_TOKEN_LEN: usize = 8;

/// Delivery mode of a message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Confirmable,
    NonConfirmable,
    Acknowledgement,
    Reset,
}

impl MessageType {
    pub fn bits(&self) -> u8 {
        match self {
            MessageType::Confirmable => 0,
            MessageType::NonConfirmable => 1,
            MessageType::Acknowledgement => 2,
            MessageType::Reset => 3,
        }
    }

    pub fn from_bits(bits: u8) -> Self {
        match bits & 0x3 {
            0 => MessageType::Confirmable,
            1 => MessageType::NonConfirmable,
            2 => MessageType::Acknowledgement,
            _ => MessageType::Reset,
        }
    }
}

/// Method or response code, `class.detail` packed into one byte
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Code(pub u8);

impl Code {
    pub const EMPTY: Code = Code(0x00);
    pub const GET: Code = Code(0x01);
    pub const POST: Code = Code(0x02);
    pub const PUT: Code = Code(0x03);
    pub const DELETE: Code = Code(0x04);
    pub const CREATED: Code = Code::new(2, 1);
    pub const CHANGED: Code = Code::new(2, 4);
    pub const CONTENT: Code = Code::new(2, 5);
    pub const BAD_REQUEST: Code = Code::new(4, 0);
    pub const NOT_FOUND: Code = Code::new(4, 4);
    pub const METHOD_NOT_ALLOWED: Code = Code::new(4, 5);
    pub const INTERNAL_SERVER_ERROR: Code = Code::new(5, 0);

    pub const fn new(class: u8, detail: u8) -> Self {
        Code((class << 5) | (detail & 0x1F))
    }

    pub fn class(&self) -> u8 {
        self.0 >> 5
    }

    pub fn detail(&self) -> u8 {
        self.0 & 0x1F
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn is_request(&self) -> bool {
        self.class() == 0 && !self.is_empty()
    }

    pub fn is_response(&self) -> bool {
        (2..=5).contains(&self.class())
    }

    pub fn is_success(&self) -> bool {
        self.class() == 2
    }
}

impl fmt::Display for Code {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.class(), self.detail())
    }
}

/// Request methods
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
}

impl Method {
    pub fn code(&self) -> Code {
        match self {
            Method::Get => Code::GET,
            Method::Post => Code::POST,
            Method::Put => Code::PUT,
            Method::Delete => Code::DELETE,
        }
    }

    pub fn from_code(code: Code) -> Option<Self> {
        match code {
            Code::GET => Some(Method::Get),
            Code::POST => Some(Method::Post),
            Code::PUT => Some(Method::Put),
            Code::DELETE => Some(Method::Delete),
            _ => None,
        }
    }
}

/// Correlates a response with its request
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Token {
    bytes: [u8; MAX_TOKEN_LEN],
    len: u8,
}

impl Token {
    pub fn new(value: &[u8]) -> Result<Self> {
        if value.len() > MAX_TOKEN_LEN {
            return Err(Error::invalid_argument(format!(
                "token of {} bytes exceeds {}",
                value.len(),
                MAX_TOKEN_LEN
            )));
        }
        let mut bytes = [0u8; MAX_TOKEN_LEN];
        bytes[..value.len()].copy_from_slice(value);
        Ok(Token {
            bytes,
            len: value.len() as u8,
        })
    }

    /// Full-length random token
    pub fn random() -> Self {
        let mut bytes = [0u8; MAX_TOKEN_LEN];
        rand::thread_rng().fill(&mut bytes);
        Token {
            bytes,
            len: MAX_TOKEN_LEN as u8,
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.bytes[..self.len as usize]
    }

    pub fn len(&self) -> usize {
        self.len as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl fmt::Debug for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token(")?;
        for b in self.as_slice() {
            write!(f, "{:02x}", b)?;
        }
        write!(f, ")")
    }
}

/// Random initial message id
pub fn next_message_id() -> u16 {
    rand::thread_rng().gen()
}

/// A single option instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoapOption {
    pub number: u16,
    pub value: Bytes,
}

/// Block-wise transfer descriptor carried in the Block2 option
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Block2 {
    pub num: u32,
    pub more: bool,
    pub szx: u8,
}

impl Block2 {
    pub fn size(&self) -> usize {
        1 << (self.szx as usize + 4)
    }

    pub fn to_uint(&self) -> u32 {
        (self.num << 4) | (u32::from(self.more) << 3) | u32::from(self.szx & 0x7)
    }

    pub fn from_uint(value: u32) -> Result<Self> {
        let szx = (value & 0x7) as u8;
        if szx == 7 {
            return Err(Error::protocol("reserved block size exponent 7"));
        }
        Ok(Block2 {
            num: value >> 4,
            more: value & 0x8 != 0,
            szx,
        })
    }
}

/// Encodes an unsigned option value with the fewest bytes
pub fn encode_uint(value: u32) -> Bytes {
    let bytes = value.to_be_bytes();
    let skip = bytes.iter().take_while(|b| **b == 0).count();
    Bytes::copy_from_slice(&bytes[skip..])
}

/// Decodes an unsigned option value of up to four bytes
pub fn decode_uint(value: &[u8]) -> Result<u32> {
    if value.len() > 4 {
        return Err(Error::protocol(format!("uint option of {} bytes", value.len())));
    }
    Ok(value.iter().fold(0u32, |acc, b| (acc << 8) | u32::from(*b)))
}

/// One CoAP message, request or response
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub kind: MessageType,
    pub code: Code,
    pub message_id: u16,
    pub token: Token,
    /// Kept sorted by option number
    pub options: Vec<CoapOption>,
    pub payload: Bytes,
}

impl Message {
    pub fn new(kind: MessageType, code: Code, message_id: u16, token: Token) -> Self {
        Message {
            kind,
            code,
            message_id,
            token,
            options: Vec::new(),
            payload: Bytes::new(),
        }
    }

    /// Builds a request for `path` with a fresh token
    pub fn request(kind: MessageType, method: Method, message_id: u16, path: &str) -> Self {
        let mut message = Message::new(kind, method.code(), message_id, Token::random());
        message.set_path(path);
        message
    }

    /// Builds the response matching `request`
    ///
    /// Confirmable requests get a piggybacked ACK with the same id, others a
    /// non-confirmable response with `fresh_id`.
    pub fn response_to(request: &Message, code: Code, fresh_id: u16) -> Self {
        match request.kind {
            MessageType::Confirmable => {
                Message::new(MessageType::Acknowledgement, code, request.message_id, request.token)
            }
            _ => Message::new(MessageType::NonConfirmable, code, fresh_id, request.token),
        }
    }

    pub fn empty_ack(message_id: u16) -> Self {
        Message::new(MessageType::Acknowledgement, Code::EMPTY, message_id, Token::default())
    }

    pub fn reset(message_id: u16) -> Self {
        Message::new(MessageType::Reset, Code::EMPTY, message_id, Token::default())
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = payload.into();
        self
    }

    /// Inserts an option after any existing options with the same number
    pub fn add_option(&mut self, number: u16, value: impl Into<Bytes>) {
        let at = self.options.partition_point(|o| o.number <= number);
        self.options.insert(
            at,
            CoapOption {
                number,
                value: value.into(),
            },
        );
    }

    pub fn remove_option(&mut self, number: u16) {
        self.options.retain(|o| o.number != number);
    }

    pub fn option(&self, number: u16) -> Option<&CoapOption> {
        self.options.iter().find(|o| o.number == number)
    }

    pub fn options_of(&self, number: u16) -> impl Iterator<Item = &CoapOption> {
        self.options.iter().filter(move |o| o.number == number)
    }

    /// Replaces Uri-Path options with the segments of `path`
    pub fn set_path(&mut self, path: &str) {
        self.remove_option(option::URI_PATH);
        for segment in path_segments(path) {
            self.add_option(option::URI_PATH, Bytes::copy_from_slice(segment.as_bytes()));
        }
    }

    /// Uri-Path options joined with '/'
    pub fn path(&self) -> String {
        self.options_of(option::URI_PATH)
            .map(|o| String::from_utf8_lossy(&o.value).into_owned())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn set_content_format(&mut self, format: u16) {
        self.remove_option(option::CONTENT_FORMAT);
        self.add_option(option::CONTENT_FORMAT, encode_uint(u32::from(format)));
    }

    pub fn content_format(&self) -> Option<u16> {
        self.option(option::CONTENT_FORMAT)
            .and_then(|o| decode_uint(&o.value).ok())
            .map(|v| v as u16)
    }

    pub fn set_block2(&mut self, block: Block2) {
        self.remove_option(option::BLOCK2);
        self.add_option(option::BLOCK2, encode_uint(block.to_uint()));
    }

    pub fn block2(&self) -> Result<Option<Block2>> {
        match self.option(option::BLOCK2) {
            Some(o) => Ok(Some(Block2::from_uint(decode_uint(&o.value)?)?)),
            None => Ok(None),
        }
    }
}

/// Non-empty segments of a '/'-separated path
pub fn path_segments(path: &str) -> impl Iterator<Item = &str> {
    path.split('/').filter(|s| !s.is_empty())
}

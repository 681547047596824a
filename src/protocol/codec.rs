use bytes::{BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::core::{Error, Result};
use super::message::{Code, CoapOption, Message, MessageType, Token, MAX_TOKEN_LEN};

const VERSION: u8 = 1;
const PAYLOAD_MARKER: u8 = 0xFF;

/// Datagram codec for CoAP messages
///
/// Every datagram carries exactly one message, so decoding consumes the whole
/// source buffer.
#[derive(Clone, Default)]
pub struct CoapCodec;

impl CoapCodec {
    /// Creates a new message codec
    pub fn new() -> Self {
        CoapCodec
    }
}

impl Decoder for CoapCodec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>> {
        if src.is_empty() {
            return Ok(None);
        }

        let datagram = src.split().freeze();
        decode_datagram(&datagram).map(Some)
    }
}

impl Encoder<Message> for CoapCodec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<()> {
        dst.reserve(item.encoded_len());
        item.write_to(dst);
        Ok(())
    }
}

fn extended_len(value: usize) -> usize {
    match value {
        0..=12 => 0,
        13..=268 => 1,
        _ => 2,
    }
}

fn nibble(value: usize) -> u8 {
    match value {
        0..=12 => value as u8,
        13..=268 => 13,
        _ => 14,
    }
}

fn put_extended<B: BufMut>(dst: &mut B, value: usize) {
    match value {
        0..=12 => {}
        13..=268 => dst.put_u8((value - 13) as u8),
        _ => dst.put_u16((value - 269) as u16),
    }
}

impl Message {
    /// Size of the message on the wire
    pub fn encoded_len(&self) -> usize {
        let mut len = 4 + self.token.len();
        let mut previous = 0u16;
        for option in &self.options {
            let delta = usize::from(option.number - previous);
            len += 1 + extended_len(delta) + extended_len(option.value.len()) + option.value.len();
            previous = option.number;
        }
        if !self.payload.is_empty() {
            len += 1 + self.payload.len();
        }
        len
    }

    /// Encodes into a fixed buffer, returning the number of bytes written
    pub fn encode_into(&self, buf: &mut [u8]) -> Result<usize> {
        let len = self.encoded_len();
        if len > buf.len() {
            return Err(Error::resource_exhausted(format!(
                "message of {} bytes does not fit a {} byte buffer",
                len,
                buf.len()
            )));
        }
        let mut cursor = &mut buf[..len];
        self.write_to(&mut cursor);
        Ok(len)
    }

    /// Encodes into a freshly allocated buffer
    pub fn to_bytes(&self) -> Bytes {
        let mut dst = BytesMut::with_capacity(self.encoded_len());
        self.write_to(&mut dst);
        dst.freeze()
    }

    fn write_to<B: BufMut>(&self, dst: &mut B) {
        dst.put_u8((VERSION << 6) | (self.kind.bits() << 4) | self.token.len() as u8);
        dst.put_u8(self.code.0);
        dst.put_u16(self.message_id);
        dst.put_slice(self.token.as_slice());

        let mut previous = 0u16;
        for option in &self.options {
            let delta = usize::from(option.number - previous);
            let length = option.value.len();
            dst.put_u8((nibble(delta) << 4) | nibble(length));
            put_extended(dst, delta);
            put_extended(dst, length);
            dst.put_slice(&option.value);
            previous = option.number;
        }

        if !self.payload.is_empty() {
            dst.put_u8(PAYLOAD_MARKER);
            dst.put_slice(&self.payload);
        }
    }
}

struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        let end = self.pos + n;
        if end > self.data.len() {
            return Err(Error::protocol(format!(
                "truncated message: need {} bytes at offset {}",
                n, self.pos
            )));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn extended(&mut self, nibble: u8) -> Result<usize> {
        match nibble {
            0..=12 => Ok(usize::from(nibble)),
            13 => Ok(usize::from(self.take(1)?[0]) + 13),
            14 => {
                let raw = self.take(2)?;
                Ok(usize::from(u16::from_be_bytes([raw[0], raw[1]])) + 269)
            }
            _ => Err(Error::protocol("reserved option nibble 15")),
        }
    }

    fn remaining(&self) -> &'a [u8] {
        &self.data[self.pos..]
    }
}

/// Parses one datagram into a message
pub fn decode_datagram(data: &[u8]) -> Result<Message> {
    let mut reader = Reader { data, pos: 0 };
    let header = reader.take(4)?;

    let version = header[0] >> 6;
    if version != VERSION {
        return Err(Error::protocol(format!("unsupported CoAP version {}", version)));
    }
    let kind = MessageType::from_bits(header[0] >> 4);
    let token_len = usize::from(header[0] & 0x0F);
    if token_len > MAX_TOKEN_LEN {
        return Err(Error::protocol(format!("token length {} exceeds {}", token_len, MAX_TOKEN_LEN)));
    }
    let code = Code(header[1]);
    let message_id = u16::from_be_bytes([header[2], header[3]]);
    let token = Token::new(reader.take(token_len)?)?;

    let mut message = Message::new(kind, code, message_id, token);
    let mut number = 0u16;

    while !reader.remaining().is_empty() {
        let first = reader.take(1)?[0];
        if first == PAYLOAD_MARKER {
            let payload = reader.remaining();
            if payload.is_empty() {
                return Err(Error::protocol("payload marker without payload"));
            }
            message.payload = Bytes::copy_from_slice(payload);
            break;
        }

        let delta = reader.extended(first >> 4)?;
        let length = reader.extended(first & 0x0F)?;
        number = u16::try_from(usize::from(number) + delta)
            .map_err(|_| Error::protocol("option number overflow"))?;
        let value = reader.take(length)?;
        message.options.push(CoapOption {
            number,
            value: Bytes::copy_from_slice(value),
        });
    }

    Ok(message)
}

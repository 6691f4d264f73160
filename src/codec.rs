//! Binary framing for the RabbitMQ Stream protocol: a 4-byte big-endian
//! length prefix, a 2-byte key (high bit set for responses) and a 2-byte
//! version, followed by a command-specific body.
//!
//! Primitive reads/writes use a big-endian, slice-oriented cursor rather than
//! `std::io::Read`/`Write`: just `byteorder::BigEndian` over byte slices.

use byteorder::{BigEndian, ByteOrder};

use crate::error::{Error, Result};

/// Set on `key` when the frame is a response rather than a request.
pub const RESPONSE_FLAG: u16 = 0x8000;

/// The command identified by the low 15 bits of a frame's `key`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum CommandKind {
    DeclarePublisher,
    Publish,
    PublishConfirm,
    PublishError,
    QueryPublisherSequence,
    DeletePublisher,
    Subscribe,
    Deliver,
    Credit,
    StoreOffset,
    QueryOffset,
    Unsubscribe,
    CreateStream,
    DeleteStream,
    QueryMetadata,
    MetadataUpdate,
    PeerProperties,
    SaslHandshake,
    SaslAuthenticate,
    Tune,
    Open,
    Close,
    Heartbeat,
}

impl CommandKind {
    pub fn key(self) -> u16 {
        match self {
            CommandKind::DeclarePublisher => 0x01,
            CommandKind::Publish => 0x02,
            CommandKind::PublishConfirm => 0x03,
            CommandKind::PublishError => 0x04,
            CommandKind::QueryPublisherSequence => 0x05,
            CommandKind::DeletePublisher => 0x06,
            CommandKind::Subscribe => 0x07,
            CommandKind::Deliver => 0x08,
            CommandKind::Credit => 0x09,
            CommandKind::StoreOffset => 0x0A,
            CommandKind::QueryOffset => 0x0B,
            CommandKind::Unsubscribe => 0x0C,
            CommandKind::CreateStream => 0x0D,
            CommandKind::DeleteStream => 0x0E,
            CommandKind::QueryMetadata => 0x0F,
            CommandKind::MetadataUpdate => 0x10,
            CommandKind::PeerProperties => 0x11,
            CommandKind::SaslHandshake => 0x12,
            CommandKind::SaslAuthenticate => 0x13,
            CommandKind::Tune => 0x14,
            CommandKind::Open => 0x15,
            CommandKind::Close => 0x16,
            CommandKind::Heartbeat => 0x17,
        }
    }

    pub fn from_key(key: u16) -> Option<Self> {
        let bare = key & !RESPONSE_FLAG;
        Some(match bare {
            0x01 => CommandKind::DeclarePublisher,
            0x02 => CommandKind::Publish,
            0x03 => CommandKind::PublishConfirm,
            0x04 => CommandKind::PublishError,
            0x05 => CommandKind::QueryPublisherSequence,
            0x06 => CommandKind::DeletePublisher,
            0x07 => CommandKind::Subscribe,
            0x08 => CommandKind::Deliver,
            0x09 => CommandKind::Credit,
            0x0A => CommandKind::StoreOffset,
            0x0B => CommandKind::QueryOffset,
            0x0C => CommandKind::Unsubscribe,
            0x0D => CommandKind::CreateStream,
            0x0E => CommandKind::DeleteStream,
            0x0F => CommandKind::QueryMetadata,
            0x10 => CommandKind::MetadataUpdate,
            0x11 => CommandKind::PeerProperties,
            0x12 => CommandKind::SaslHandshake,
            0x13 => CommandKind::SaslAuthenticate,
            0x14 => CommandKind::Tune,
            0x15 => CommandKind::Open,
            0x16 => CommandKind::Close,
            0x17 => CommandKind::Heartbeat,
            _ => return None,
        })
    }

    /// True for commands that never carry a correlation id or response code
    /// (fire-and-forget requests, and the purely asynchronous server frames).
    pub fn is_uncorrelated(self) -> bool {
        matches!(
            self,
            CommandKind::Publish
                | CommandKind::PublishConfirm
                | CommandKind::PublishError
                | CommandKind::Credit
                | CommandKind::StoreOffset
                | CommandKind::Deliver
                | CommandKind::MetadataUpdate
                | CommandKind::Heartbeat
                | CommandKind::Tune
        )
    }
}

/// The 16-bit status carried by a response frame's correlated commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ResponseCode {
    Ok,
    StreamDoesNotExist,
    SubscriptionIdAlreadyExists,
    SubscriptionIdDoesNotExist,
    StreamAlreadyExists,
    StreamNotAvailable,
    SaslMechanismNotSupported,
    AuthenticationFailure,
    SaslError,
    SaslChallenge,
    SaslAuthenticationFailureLoopback,
    VirtualHostAccessFailure,
    UnknownFrame,
    FrameTooLarge,
    InternalError,
    AccessRefused,
    PreconditionFailed,
    PublisherDoesNotExist,
    NoOffset,
}

impl ResponseCode {
    pub fn from_u16(code: u16) -> Option<Self> {
        Some(match code {
            0x01 => ResponseCode::Ok,
            0x02 => ResponseCode::StreamDoesNotExist,
            0x03 => ResponseCode::SubscriptionIdAlreadyExists,
            0x04 => ResponseCode::SubscriptionIdDoesNotExist,
            0x05 => ResponseCode::StreamAlreadyExists,
            0x06 => ResponseCode::StreamNotAvailable,
            0x07 => ResponseCode::SaslMechanismNotSupported,
            0x08 => ResponseCode::AuthenticationFailure,
            0x09 => ResponseCode::SaslError,
            0x0A => ResponseCode::SaslChallenge,
            0x0B => ResponseCode::SaslAuthenticationFailureLoopback,
            0x0C => ResponseCode::VirtualHostAccessFailure,
            0x0D => ResponseCode::UnknownFrame,
            0x0E => ResponseCode::FrameTooLarge,
            0x0F => ResponseCode::InternalError,
            0x10 => ResponseCode::AccessRefused,
            0x11 => ResponseCode::PreconditionFailed,
            0x12 => ResponseCode::PublisherDoesNotExist,
            0x13 => ResponseCode::NoOffset,
            _ => return None,
        })
    }

    pub fn to_u16(self) -> u16 {
        match self {
            ResponseCode::Ok => 0x01,
            ResponseCode::StreamDoesNotExist => 0x02,
            ResponseCode::SubscriptionIdAlreadyExists => 0x03,
            ResponseCode::SubscriptionIdDoesNotExist => 0x04,
            ResponseCode::StreamAlreadyExists => 0x05,
            ResponseCode::StreamNotAvailable => 0x06,
            ResponseCode::SaslMechanismNotSupported => 0x07,
            ResponseCode::AuthenticationFailure => 0x08,
            ResponseCode::SaslError => 0x09,
            ResponseCode::SaslChallenge => 0x0A,
            ResponseCode::SaslAuthenticationFailureLoopback => 0x0B,
            ResponseCode::VirtualHostAccessFailure => 0x0C,
            ResponseCode::UnknownFrame => 0x0D,
            ResponseCode::FrameTooLarge => 0x0E,
            ResponseCode::InternalError => 0x0F,
            ResponseCode::AccessRefused => 0x10,
            ResponseCode::PreconditionFailed => 0x11,
            ResponseCode::PublisherDoesNotExist => 0x12,
            ResponseCode::NoOffset => 0x13,
        }
    }

    pub fn is_ok(self) -> bool {
        matches!(self, ResponseCode::Ok)
    }
}

/// Cursor over a decoded frame body. Every read advances the cursor and
/// fails with `MalformedFrame` on truncated input rather than panicking.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Reader { buf, pos: 0 }
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        if self.pos + len > self.buf.len() {
            return Err(Error::MalformedFrame);
        }
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    pub fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    pub fn read_u16(&mut self) -> Result<u16> {
        Ok(BigEndian::read_u16(self.take(2)?))
    }

    pub fn read_i16(&mut self) -> Result<i16> {
        Ok(BigEndian::read_i16(self.take(2)?))
    }

    pub fn read_u32(&mut self) -> Result<u32> {
        Ok(BigEndian::read_u32(self.take(4)?))
    }

    pub fn read_i32(&mut self) -> Result<i32> {
        Ok(BigEndian::read_i32(self.take(4)?))
    }

    pub fn read_u64(&mut self) -> Result<u64> {
        Ok(BigEndian::read_u64(self.take(8)?))
    }

    pub fn read_i64(&mut self) -> Result<i64> {
        Ok(BigEndian::read_i64(self.take(8)?))
    }

    /// A 2-byte signed length prefix (`-1` means absent) followed by UTF-8.
    pub fn read_string(&mut self) -> Result<Option<String>> {
        let len = self.read_i16()?;
        if len < 0 {
            return Ok(None);
        }
        let bytes = self.take(len as usize)?;
        let s = std::str::from_utf8(bytes).map_err(|_| Error::MalformedFrame)?;
        Ok(Some(s.to_owned()))
    }

    /// A 4-byte length prefix followed by raw bytes.
    pub fn read_bytes(&mut self) -> Result<Vec<u8>> {
        let len = self.read_u32()? as usize;
        Ok(self.take(len)?.to_vec())
    }
}

/// Growable buffer for building an outgoing frame body.
#[derive(Debug, Default)]
pub struct Writer {
    buf: Vec<u8>,
}

impl Writer {
    pub fn new() -> Self {
        Writer { buf: Vec::new() }
    }

    pub fn write_u8(&mut self, v: u8) {
        self.buf.push(v);
    }

    pub fn write_u16(&mut self, v: u16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_u16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_u32(&mut self, v: u32) {
        let mut tmp = [0u8; 4];
        BigEndian::write_u32(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_i64(&mut self, v: i64) {
        let mut tmp = [0u8; 8];
        BigEndian::write_i64(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_string(&mut self, v: Option<&str>) {
        match v {
            None => self.write_i16(-1),
            Some(s) => {
                self.write_i16(s.len() as i16);
                self.buf.extend_from_slice(s.as_bytes());
            }
        }
    }

    fn write_i16(&mut self, v: i16) {
        let mut tmp = [0u8; 2];
        BigEndian::write_i16(&mut tmp, v);
        self.buf.extend_from_slice(&tmp);
    }

    pub fn write_bytes(&mut self, v: &[u8]) {
        self.write_u32(v.len() as u32);
        self.buf.extend_from_slice(v);
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.buf
    }
}

/// Prepends the 4-byte length prefix and assembles `key`/`version` ahead of
/// `body`, ready to write to the socket.
pub fn encode_frame(key: u16, version: u16, body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + 4 + body.len());
    let length = (4 + body.len()) as u32;
    let mut len_buf = [0u8; 4];
    BigEndian::write_u32(&mut len_buf, length);
    out.extend_from_slice(&len_buf);
    let mut head = [0u8; 4];
    BigEndian::write_u16(&mut head[0..2], key);
    BigEndian::write_u16(&mut head[2..4], version);
    out.extend_from_slice(&head);
    out.extend_from_slice(body);
    out
}

/// Reads the 4-byte big-endian length prefix from the front of a buffer.
/// Returns `None` if fewer than 4 bytes are available yet.
pub fn try_read_frame_length(buf: &[u8]) -> Option<u32> {
    if buf.len() < 4 {
        return None;
    }
    Some(BigEndian::read_u32(&buf[0..4]))
}

/// Decoded frame header: which command, whether it is a response, the
/// version, and a cursor positioned just after the header ready to read the
/// command-specific body.
pub struct DecodedFrame<'a> {
    pub kind: CommandKind,
    pub is_response: bool,
    pub version: u16,
    pub reader: Reader<'a>,
}

/// Decodes the key/version header out of a frame payload (the bytes after
/// the length prefix has already been stripped and validated by the reader
/// task) and returns a cursor over the remaining body.
pub fn decode_frame(payload: &[u8]) -> Result<DecodedFrame<'_>> {
    if payload.len() < 4 {
        return Err(Error::MalformedFrame);
    }
    let key = BigEndian::read_u16(&payload[0..2]);
    let version = BigEndian::read_u16(&payload[2..4]);
    let is_response = key & RESPONSE_FLAG != 0;
    let kind = CommandKind::from_key(key).ok_or(Error::UnknownCommand(key))?;
    Ok(DecodedFrame {
        kind,
        is_response,
        version,
        reader: Reader::new(&payload[4..]),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_key_round_trips() {
        for kind in [
            CommandKind::DeclarePublisher,
            CommandKind::Subscribe,
            CommandKind::Deliver,
            CommandKind::Close,
            CommandKind::Tune,
        ] {
            assert_eq!(CommandKind::from_key(kind.key()), Some(kind));
        }
    }

    #[test]
    fn response_flag_is_stripped_before_lookup() {
        let key = CommandKind::CreateStream.key() | RESPONSE_FLAG;
        assert_eq!(CommandKind::from_key(key), Some(CommandKind::CreateStream));
    }

    #[test]
    fn response_code_round_trips() {
        for code in 0x01u16..=0x13 {
            let parsed = ResponseCode::from_u16(code).expect("known code");
            assert_eq!(parsed.to_u16(), code);
        }
        assert_eq!(ResponseCode::from_u16(0xFF), None);
    }

    #[test]
    fn string_round_trip() {
        let mut w = Writer::new();
        w.write_string(Some("hello"));
        w.write_string(None);
        let body = w.into_vec();
        let mut r = Reader::new(&body);
        assert_eq!(r.read_string().unwrap(), Some("hello".to_owned()));
        assert_eq!(r.read_string().unwrap(), None);
    }

    #[test]
    fn bytes_round_trip() {
        let mut w = Writer::new();
        w.write_bytes(&[1, 2, 3, 4]);
        let body = w.into_vec();
        let mut r = Reader::new(&body);
        assert_eq!(r.read_bytes().unwrap(), vec![1, 2, 3, 4]);
    }

    #[test]
    fn truncated_read_is_malformed() {
        let body = [0u8, 1];
        let mut r = Reader::new(&body);
        assert_eq!(r.read_u32(), Err(Error::MalformedFrame));
    }

    #[test]
    fn frame_round_trip() {
        let mut w = Writer::new();
        w.write_u32(42);
        let body = w.into_vec();
        let framed = encode_frame(CommandKind::CreateStream.key(), 1, &body);
        let length = try_read_frame_length(&framed).unwrap();
        assert_eq!(length as usize, framed.len() - 4);
        let decoded = decode_frame(&framed[4..]).unwrap();
        assert_eq!(decoded.kind, CommandKind::CreateStream);
        assert!(!decoded.is_response);
        let mut reader = decoded.reader;
        assert_eq!(reader.read_u32().unwrap(), 42);
    }
}

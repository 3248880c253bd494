// Copyright 2020 - 2021 Alex Dukhno
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

pub mod connection;

use crate::connection::{Channel, Plain, Secure};
use std::{collections::HashMap, io, str};
use wire_protocol_payload::*;

/// Frames above this size are rejected before the payload is read.
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;

pub type WireResult = std::result::Result<InboundMessage, WireError>;

/// Structural failure while reading a frame off the socket
#[derive(Debug, PartialEq)]
pub enum FrameError {
    /// channel closed in the middle of a frame
    UnexpectedEof,
    /// payload ended before a fixed-width field
    ShortRead,
    /// length field below the mandatory 4 bytes or above `MAX_FRAME_LENGTH`
    MalformedLength(i32),
    /// a c-string field is not NUL-terminated inside the frame
    UnterminatedString,
    /// field bytes are not valid UTF-8
    InvalidUtf8,
}

/// Failure to turn a frame into an [`InboundMessage`]
#[derive(Debug, PartialEq)]
pub enum WireError {
    /// tag byte does not name a frontend message; the frame was consumed
    UnknownTag(u8),
    /// a Describe/Close carried a discriminator other than 'S' or 'P'
    InvalidDiscriminator(u8),
    /// frame structure is broken, the connection cannot continue
    Frame(FrameError),
}

impl WireError {
    /// `true` when the offending frame was fully consumed and the stream can
    /// keep being read
    pub fn is_recoverable(&self) -> bool {
        match self {
            WireError::UnknownTag(_) | WireError::InvalidDiscriminator(_) => true,
            WireError::Frame(_) => false,
        }
    }
}

/// Client messages and server responses of an established session
pub trait WireConnection {
    /// receives and decodes the next client message
    fn receive(&mut self) -> io::Result<WireResult>;

    /// appends an outbound message to the output buffer
    fn send(&mut self, outbound: OutboundMessage) -> io::Result<()>;

    /// writes out everything buffered so far; called at message boundaries only
    fn flush(&mut self) -> io::Result<()>;
}

struct PayloadCursor<'p> {
    buf: &'p [u8],
}

impl<'p> PayloadCursor<'p> {
    fn new(buf: &'p [u8]) -> PayloadCursor<'p> {
        PayloadCursor { buf }
    }

    fn read_cstr(&mut self) -> Result<String, WireError> {
        match self.buf.iter().position(|b| *b == 0) {
            Some(pos) => {
                let value = str::from_utf8(&self.buf[..pos])
                    .map_err(|_| WireError::Frame(FrameError::InvalidUtf8))?
                    .to_owned();
                self.buf = &self.buf[pos + 1..];
                Ok(value)
            }
            None => Err(WireError::Frame(FrameError::UnterminatedString)),
        }
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'p [u8], WireError> {
        if self.buf.len() < len {
            return Err(WireError::Frame(FrameError::ShortRead));
        }
        let (head, tail) = self.buf.split_at(len);
        self.buf = tail;
        Ok(head)
    }

    fn read_u8(&mut self) -> Result<u8, WireError> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    fn read_i16(&mut self) -> Result<i16, WireError> {
        let bytes = self.read_bytes(2)?;
        Ok(i16::from_be_bytes([bytes[0], bytes[1]]))
    }

    fn read_i32(&mut self) -> Result<i32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(i32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u32(&mut self) -> Result<u32, WireError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn rest(&mut self) -> Vec<u8> {
        let rest = self.buf.to_vec();
        self.buf = &[];
        rest
    }
}

/// Decodes a regular (tagged) frontend frame into an [`InboundMessage`]
pub fn decode_inbound(tag: u8, payload: &[u8]) -> WireResult {
    let mut cursor = PayloadCursor::new(payload);
    match tag {
        QUERY => {
            let sql = cursor.read_cstr()?;
            Ok(InboundMessage::Query { sql })
        }
        PARSE => {
            let statement_name = cursor.read_cstr()?;
            let sql = cursor.read_cstr()?;
            let type_count = cursor.read_i16()?;
            let mut param_types = Vec::with_capacity(type_count.max(0) as usize);
            for _ in 0..type_count {
                param_types.push(cursor.read_u32()?);
            }
            Ok(InboundMessage::Parse {
                statement_name,
                sql,
                param_types,
            })
        }
        BIND => {
            let portal_name = cursor.read_cstr()?;
            let statement_name = cursor.read_cstr()?;

            let format_count = cursor.read_i16()?;
            let mut param_formats = Vec::with_capacity(format_count.max(0) as usize);
            for _ in 0..format_count {
                param_formats.push(cursor.read_i16()?);
            }

            let param_count = cursor.read_i16()?;
            let mut raw_params = Vec::with_capacity(param_count.max(0) as usize);
            for _ in 0..param_count {
                let len = cursor.read_i32()?;
                if len == -1 {
                    // As a special case, -1 indicates a NULL parameter value.
                    raw_params.push(None);
                } else {
                    raw_params.push(Some(cursor.read_bytes(len as usize)?.to_vec()));
                }
            }

            let result_format_count = cursor.read_i16()?;
            let mut result_formats = Vec::with_capacity(result_format_count.max(0) as usize);
            for _ in 0..result_format_count {
                result_formats.push(cursor.read_i16()?);
            }

            Ok(InboundMessage::Bind {
                portal_name,
                statement_name,
                param_formats,
                raw_params,
                result_formats,
            })
        }
        DESCRIBE => {
            let discriminator = cursor.read_u8()?;
            let name = cursor.read_cstr()?;
            match discriminator {
                b'S' => Ok(InboundMessage::DescribeStatement { name }),
                b'P' => Ok(InboundMessage::DescribePortal { name }),
                other => Err(WireError::InvalidDiscriminator(other)),
            }
        }
        CLOSE => {
            let discriminator = cursor.read_u8()?;
            let name = cursor.read_cstr()?;
            match discriminator {
                b'S' => Ok(InboundMessage::CloseStatement { name }),
                b'P' => Ok(InboundMessage::ClosePortal { name }),
                other => Err(WireError::InvalidDiscriminator(other)),
            }
        }
        EXECUTE => {
            let portal_name = cursor.read_cstr()?;
            let max_rows = cursor.read_i32()?;
            Ok(InboundMessage::Execute { portal_name, max_rows })
        }
        FLUSH => Ok(InboundMessage::Flush),
        SYNC => Ok(InboundMessage::Sync),
        COPY_DATA => Ok(InboundMessage::CopyData(cursor.rest())),
        COPY_DONE => Ok(InboundMessage::CopyDone),
        COPY_FAIL => {
            let reason = cursor.read_cstr()?;
            Ok(InboundMessage::CopyFail(reason))
        }
        TERMINATE => Ok(InboundMessage::Terminate),
        other => Err(WireError::UnknownTag(other)),
    }
}

/// An established client session over a plain or TLS channel.
///
/// Output is buffered; [`WireConnection::flush`] pushes it to the socket.
pub struct ClientConnection<P: Plain, S: Secure> {
    channel: Channel<P, S>,
    properties: HashMap<String, String>,
    outbox: Vec<u8>,
}

impl<P: Plain, S: Secure> ClientConnection<P, S> {
    pub fn new(channel: Channel<P, S>, properties: HashMap<String, String>) -> ClientConnection<P, S> {
        ClientConnection {
            channel,
            properties,
            outbox: vec![],
        }
    }

    /// startup parameters the client sent (database, user, options, ...)
    pub fn properties(&self) -> &HashMap<String, String> {
        &self.properties
    }
}

impl<P: Plain, S: Secure> WireConnection for ClientConnection<P, S> {
    fn receive(&mut self) -> io::Result<WireResult> {
        let tag = match self.channel.read_tag() {
            Ok(tag) => tag,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                // Client disconnected the socket immediately without sending a
                // Terminate message. Considers it as a client Terminate to save
                // resource and exit smoothly.
                log::debug!("client disconnected without Terminate");
                return Ok(Ok(InboundMessage::Terminate));
            }
            Err(err) => return Err(err),
        };
        let len = match self.channel.read_message_len() {
            Ok(len) => len,
            Err(err) if err.kind() == io::ErrorKind::InvalidData => {
                return Ok(Err(WireError::Frame(FrameError::MalformedLength(-1))));
            }
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Err(WireError::Frame(FrameError::UnexpectedEof)));
            }
            Err(err) => return Err(err),
        };
        if len > MAX_FRAME_LENGTH {
            return Ok(Err(WireError::Frame(FrameError::MalformedLength(len as i32 + 4))));
        }
        let payload = match self.channel.read_message(len) {
            Ok(payload) => payload,
            Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => {
                return Ok(Err(WireError::Frame(FrameError::UnexpectedEof)));
            }
            Err(err) => return Err(err),
        };
        Ok(decode_inbound(tag, &payload))
    }

    fn send(&mut self, outbound: OutboundMessage) -> io::Result<()> {
        log::trace!("response message {:?}", outbound);
        let encoded: Vec<u8> = outbound.into();
        self.outbox.extend_from_slice(&encoded);
        Ok(())
    }

    fn flush(&mut self) -> io::Result<()> {
        use std::io::Write;
        self.channel.write_all(&self.outbox)?;
        self.outbox.clear();
        self.channel.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(tag: u8, payload: &[u8]) -> Vec<u8> {
        let mut buff = vec![tag];
        buff.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        buff.extend_from_slice(payload);
        buff
    }

    #[test]
    fn decode_query() {
        assert_eq!(
            decode_inbound(QUERY, b"select 1\0"),
            Ok(InboundMessage::Query {
                sql: "select 1".to_owned()
            })
        );
    }

    #[test]
    fn decode_query_without_terminator() {
        assert_eq!(
            decode_inbound(QUERY, b"select 1"),
            Err(WireError::Frame(FrameError::UnterminatedString))
        );
    }

    #[test]
    fn decode_parse_with_param_types() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"stmt\0select $1\0");
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&INT.to_be_bytes());

        assert_eq!(
            decode_inbound(PARSE, &payload),
            Ok(InboundMessage::Parse {
                statement_name: "stmt".to_owned(),
                sql: "select $1".to_owned(),
                param_types: vec![INT],
            })
        );
    }

    #[test]
    fn decode_bind_with_null_param() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"portal\0stmt\0");
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&0i16.to_be_bytes());
        payload.extend_from_slice(&2i16.to_be_bytes());
        payload.extend_from_slice(&2i32.to_be_bytes());
        payload.extend_from_slice(b"42");
        payload.extend_from_slice(&(-1i32).to_be_bytes());
        payload.extend_from_slice(&0i16.to_be_bytes());

        assert_eq!(
            decode_inbound(BIND, &payload),
            Ok(InboundMessage::Bind {
                portal_name: "portal".to_owned(),
                statement_name: "stmt".to_owned(),
                param_formats: vec![0],
                raw_params: vec![Some(b"42".to_vec()), None],
                result_formats: vec![],
            })
        );
    }

    #[test]
    fn decode_bind_with_truncated_param() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"\0\0");
        payload.extend_from_slice(&0i16.to_be_bytes());
        payload.extend_from_slice(&1i16.to_be_bytes());
        payload.extend_from_slice(&100i32.to_be_bytes());
        payload.extend_from_slice(b"short");

        assert_eq!(decode_inbound(BIND, &payload), Err(WireError::Frame(FrameError::ShortRead)));
    }

    #[test]
    fn decode_describe_statement_and_portal() {
        assert_eq!(
            decode_inbound(DESCRIBE, b"Sstmt\0"),
            Ok(InboundMessage::DescribeStatement { name: "stmt".to_owned() })
        );
        assert_eq!(
            decode_inbound(DESCRIBE, b"P\0"),
            Ok(InboundMessage::DescribePortal { name: "".to_owned() })
        );
        assert_eq!(decode_inbound(DESCRIBE, b"Xstmt\0"), Err(WireError::InvalidDiscriminator(b'X')));
    }

    #[test]
    fn decode_execute() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"portal\0");
        payload.extend_from_slice(&10i32.to_be_bytes());
        assert_eq!(
            decode_inbound(EXECUTE, &payload),
            Ok(InboundMessage::Execute {
                portal_name: "portal".to_owned(),
                max_rows: 10,
            })
        );
    }

    #[test]
    fn decode_copy_messages() {
        assert_eq!(
            decode_inbound(COPY_DATA, b"1\tone\n"),
            Ok(InboundMessage::CopyData(b"1\tone\n".to_vec()))
        );
        assert_eq!(decode_inbound(COPY_DONE, b""), Ok(InboundMessage::CopyDone));
        assert_eq!(
            decode_inbound(COPY_FAIL, b"canceled\0"),
            Ok(InboundMessage::CopyFail("canceled".to_owned()))
        );
    }

    #[test]
    fn decode_unknown_tag_is_recoverable() {
        let error = decode_inbound(b'z', b"").unwrap_err();
        assert!(error.is_recoverable());
        assert_eq!(error, WireError::UnknownTag(b'z'));
    }

    #[test]
    fn frame_errors_are_fatal() {
        assert!(!WireError::Frame(FrameError::UnexpectedEof).is_recoverable());
    }

    #[test]
    fn framing_consumes_exactly_length_plus_tag() {
        // two frames back to back decode independently
        let first = frame(QUERY, b"select 1\0");
        let second = frame(SYNC, b"");
        let mut stream = first.clone();
        stream.extend_from_slice(&second);

        let len = i32::from_be_bytes([stream[1], stream[2], stream[3], stream[4]]) as usize;
        assert_eq!(len + 1, first.len());
        assert_eq!(&stream[first.len()..], second.as_slice());
    }
}

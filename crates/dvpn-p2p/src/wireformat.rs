//! Channel Wire Formats
//!
//! A channel frame is a [`TransportMsg`]. Two encodings exist and a channel
//! picks one at handshake time:
//!
//! Text, MIME-like header lines followed by a dot-terminated body:
//! ```text
//! Request-ID:7\r\n
//! Topic:ping\r\n
//! Status-Code:0\r\n
//! Message:\r\n
//! \r\n
//! <body, '.' doubled at line starts>\r\n
//! .\r\n
//! ```
//!
//! Binary, an unsigned varint length followed by a bincode envelope.
//!
//! Both decoders return `Ok(None)` until a whole frame is buffered and only
//! consume the bytes of complete frames.

use std::sync::Arc;

use bincode::Options;
use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::config::WireFormatKind;
use crate::error::{P2PError, P2PResult};

/// Largest frame either codec accepts
pub const MAX_MESSAGE_LEN: usize = 128 * 1024;

const HEADER_REQUEST_ID: &str = "Request-ID";
const HEADER_TOPIC: &str = "Topic";
const HEADER_STATUS_CODE: &str = "Status-Code";
const HEADER_MESSAGE: &str = "Message";

const CRLF: &[u8] = b"\r\n";
const HEADER_END: &[u8] = b"\r\n\r\n";
const MAX_VARINT_LEN: usize = 10;

/// Reply status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum StatusCode {
    Ok = 0,
    InternalErr = 1,
    PublicErr = 2,
    HandlerNotFound = 3,
}

impl StatusCode {
    pub fn code(self) -> u32 {
        self as u32
    }

    pub fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(StatusCode::Ok),
            1 => Some(StatusCode::InternalErr),
            2 => Some(StatusCode::PublicErr),
            3 => Some(StatusCode::HandlerNotFound),
            _ => None,
        }
    }
}

/// One channel frame.
///
/// Requests carry a topic; replies carry an empty topic and the id of the
/// request they answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportMsg {
    pub id: u64,
    pub topic: String,
    pub status_code: StatusCode,
    pub msg: String,
    pub data: Vec<u8>,
}

impl TransportMsg {
    pub fn request(id: u64, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id,
            topic: topic.into(),
            status_code: StatusCode::Ok,
            msg: String::new(),
            data,
        }
    }

    pub fn reply(id: u64, status_code: StatusCode, msg: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id,
            topic: String::new(),
            status_code,
            msg: msg.into(),
            data,
        }
    }

    pub fn is_request(&self) -> bool {
        !self.topic.is_empty()
    }
}

/// Frame encoder/decoder
pub trait WireFormat: Send + Sync {
    fn kind(&self) -> WireFormatKind;

    /// Append one encoded frame to `dst`
    fn encode(&self, msg: &TransportMsg, dst: &mut BytesMut) -> P2PResult<()>;

    /// Take one frame off the front of `src`, or `None` if it is incomplete
    fn decode(&self, src: &mut BytesMut) -> P2PResult<Option<TransportMsg>>;
}

/// Codec for `kind`
pub fn wire_format(kind: WireFormatKind) -> Arc<dyn WireFormat> {
    match kind {
        WireFormatKind::Text => Arc::new(TextWireFormat),
        WireFormatKind::Binary => Arc::new(BinaryWireFormat),
    }
}

/// Header lines and a dot-stuffed body
#[derive(Debug, Default, Clone, Copy)]
pub struct TextWireFormat;

impl WireFormat for TextWireFormat {
    fn kind(&self) -> WireFormatKind {
        WireFormatKind::Text
    }

    fn encode(&self, msg: &TransportMsg, dst: &mut BytesMut) -> P2PResult<()> {
        if msg.data.len() > MAX_MESSAGE_LEN {
            return Err(P2PError::MessageTooLong {
                len: msg.data.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        dst.reserve(msg.data.len() + msg.msg.len() + msg.topic.len() + 96);
        put_header(dst, HEADER_REQUEST_ID, &msg.id.to_string());
        put_header(dst, HEADER_TOPIC, &msg.topic);
        put_header(dst, HEADER_STATUS_CODE, &msg.status_code.code().to_string());
        put_header(dst, HEADER_MESSAGE, &msg.msg);
        dst.put_slice(CRLF);

        let mut line_start = true;
        for &b in &msg.data {
            if line_start && b == b'.' {
                dst.put_u8(b'.');
            }
            dst.put_u8(b);
            line_start = b == b'\n';
        }
        dst.put_slice(b"\r\n.\r\n");
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> P2PResult<Option<TransportMsg>> {
        let Some(header_len) = find(src, HEADER_END) else {
            if src.len() > MAX_MESSAGE_LEN {
                return Err(P2PError::MessageTooLong {
                    len: src.len(),
                    max: MAX_MESSAGE_LEN,
                });
            }
            return Ok(None);
        };
        let body_start = header_len + HEADER_END.len();

        let Some((data, frame_len)) = unstuff_body(&src[body_start..])? else {
            if src.len() > MAX_MESSAGE_LEN * 2 {
                return Err(P2PError::MessageTooLong {
                    len: src.len(),
                    max: MAX_MESSAGE_LEN,
                });
            }
            return Ok(None);
        };

        let headers = std::str::from_utf8(&src[..header_len])
            .map_err(|_| P2PError::Wire("headers are not UTF-8".into()))?;
        let mut id = None;
        let mut topic = String::new();
        let mut status_code = StatusCode::Ok;
        let mut message = String::new();
        for line in headers.split("\r\n") {
            let Some((key, value)) = line.split_once(':') else {
                return Err(P2PError::Wire(format!("malformed header line {:?}", line)));
            };
            match key {
                HEADER_REQUEST_ID => {
                    id = Some(value.parse::<u64>().map_err(|_| {
                        P2PError::Wire(format!("invalid request id {:?}", value))
                    })?)
                }
                HEADER_TOPIC => topic = value.to_string(),
                HEADER_STATUS_CODE => status_code = parse_status(value)?,
                HEADER_MESSAGE => message = value.to_string(),
                _ => {}
            }
        }
        let id = id.ok_or_else(|| P2PError::Wire("missing Request-ID header".into()))?;

        src.advance(body_start + frame_len);
        Ok(Some(TransportMsg {
            id,
            topic,
            status_code,
            msg: message,
            data,
        }))
    }
}

fn put_header(dst: &mut BytesMut, key: &str, value: &str) {
    dst.put_slice(key.as_bytes());
    dst.put_u8(b':');
    // Header values are single lines
    for b in value.bytes() {
        dst.put_u8(if b == b'\r' || b == b'\n' { b' ' } else { b });
    }
    dst.put_slice(CRLF);
}

fn parse_status(value: &str) -> P2PResult<StatusCode> {
    value
        .parse::<u32>()
        .ok()
        .and_then(StatusCode::from_code)
        .ok_or_else(|| P2PError::Wire(format!("invalid status code {:?}", value)))
}

/// Undo dot stuffing. Returns the body and the number of bytes consumed
/// including the terminator, or `None` when the terminator is not buffered.
fn unstuff_body(buf: &[u8]) -> P2PResult<Option<(Vec<u8>, usize)>> {
    let mut out = Vec::with_capacity(buf.len());
    let mut line_start = true;
    let mut i = 0;
    while i < buf.len() {
        let b = buf[i];
        if line_start && b == b'.' {
            match buf.get(i + 1) {
                None => return Ok(None),
                Some(b'.') => {
                    out.push(b'.');
                    line_start = false;
                    i += 2;
                    continue;
                }
                Some(b'\r') => match buf.get(i + 2) {
                    None => return Ok(None),
                    Some(b'\n') => {
                        // Drop the CRLF written before the terminator
                        if !out.ends_with(CRLF) {
                            return Err(P2PError::Wire("body terminator without CRLF".into()));
                        }
                        out.truncate(out.len() - CRLF.len());
                        return Ok(Some((out, i + 3)));
                    }
                    Some(_) => return Err(P2PError::Wire("unstuffed dot in body".into())),
                },
                Some(_) => return Err(P2PError::Wire("unstuffed dot in body".into())),
            }
        }
        out.push(b);
        line_start = b == b'\n';
        i += 1;
    }
    Ok(None)
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}

/// Unsigned varint length prefix plus a bincode envelope
#[derive(Debug, Default, Clone, Copy)]
pub struct BinaryWireFormat;

#[derive(Serialize, Deserialize)]
struct Envelope {
    id: u64,
    status_code: u32,
    topic: String,
    msg: String,
    #[serde(with = "serde_bytes")]
    data: Vec<u8>,
}

fn envelope_codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_MESSAGE_LEN as u64 + 1024)
}

impl WireFormat for BinaryWireFormat {
    fn kind(&self) -> WireFormatKind {
        WireFormatKind::Binary
    }

    fn encode(&self, msg: &TransportMsg, dst: &mut BytesMut) -> P2PResult<()> {
        let envelope = Envelope {
            id: msg.id,
            status_code: msg.status_code.code(),
            topic: msg.topic.clone(),
            msg: msg.msg.clone(),
            data: msg.data.clone(),
        };
        let body = envelope_codec().serialize(&envelope)?;
        if body.len() > MAX_MESSAGE_LEN {
            return Err(P2PError::MessageTooLong {
                len: body.len(),
                max: MAX_MESSAGE_LEN,
            });
        }
        put_uvarint(dst, body.len() as u64);
        dst.put_slice(&body);
        Ok(())
    }

    fn decode(&self, src: &mut BytesMut) -> P2PResult<Option<TransportMsg>> {
        let Some((len, prefix)) = read_uvarint(src)? else {
            return Ok(None);
        };
        let len = usize::try_from(len).unwrap_or(usize::MAX);
        if len > MAX_MESSAGE_LEN {
            return Err(P2PError::MessageTooLong {
                len,
                max: MAX_MESSAGE_LEN,
            });
        }
        if src.len() < prefix + len {
            return Ok(None);
        }

        src.advance(prefix);
        let body = src.split_to(len);
        let envelope: Envelope = envelope_codec().deserialize(&body)?;
        let status_code = StatusCode::from_code(envelope.status_code).ok_or_else(|| {
            P2PError::Wire(format!("invalid status code {}", envelope.status_code))
        })?;
        Ok(Some(TransportMsg {
            id: envelope.id,
            topic: envelope.topic,
            status_code,
            msg: envelope.msg,
            data: envelope.data,
        }))
    }
}

fn put_uvarint(dst: &mut BytesMut, mut value: u64) {
    while value >= 0x80 {
        dst.put_u8((value as u8) | 0x80);
        value >>= 7;
    }
    dst.put_u8(value as u8);
}

/// Returns the value and the prefix length, or `None` if more bytes are needed
fn read_uvarint(src: &[u8]) -> P2PResult<Option<(u64, usize)>> {
    let mut value: u64 = 0;
    for (i, &b) in src.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(P2PError::Wire("length prefix overflows".into()));
        }
        value |= u64::from(b & 0x7f) << (7 * i);
        if b < 0x80 {
            return Ok(Some((value, i + 1)));
        }
    }
    Ok(None)
}

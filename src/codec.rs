//! Wire frame parsing and JSON-RPC 2.0 emission.
//!
//! # Inbound layout
//!
//! ```text
//! ┌──────────────────┬───────────┬──────────────────────────────┐
//! │ req_id: u64 (le) │ method u8 │ method-specific payload      │
//! └──────────────────┴───────────┴──────────────────────────────┘
//!   8 bytes            1 byte      rest of frame
//! ```
//!
//! `req_id` must be nonzero; `method` must be below the `Unknown` sentinel
//! ([`METHOD_COUNT`]). Start carries a UTF-8 pipeline descriptor (may be
//! empty); stop/pause/resume carry exactly 4 little-endian bytes of pipeline
//! id. All multibyte integers are little-endian, no padding.
//!
//! # Zero copy
//!
//! [`parse`] validates against the raw buffer and records payload **offsets**
//! ([`Params`]), never copies. The offsets are only meaningful against the
//! frame they were parsed from, which travels alongside them inside the task.
//!
//! # Outbound
//!
//! JSON-RPC 2.0 envelopes produced by direct formatting into a [`FrameBuf`];
//! string fields are JSON-escaped. No general-purpose JSON encoder is
//! involved.

use std::fmt::{self, Write as _};
use std::ops::Range;

/// Fixed request header: 8 id bytes plus 1 method byte.
pub const HEADER_LEN: usize = 9;

const _: () = assert!(HEADER_LEN == std::mem::size_of::<u64>() + std::mem::size_of::<u8>());

/// JSON-RPC 2.0 error codes used on the wire.
pub const CODE_PARSE_ERROR: i32 = -32700;
pub const CODE_INVALID_REQUEST: i32 = -32600;
pub const CODE_METHOD_NOT_FOUND: i32 = -32601;
pub const CODE_APP_ERROR: i32 = -32000;

/// Canonical JSON-RPC message for a code. Application errors carry their own
/// message instead.
pub fn canonical_message(code: i32) -> &'static str {
    match code {
        CODE_PARSE_ERROR => "Parse error",
        CODE_INVALID_REQUEST => "Invalid Request",
        CODE_METHOD_NOT_FOUND => "Method not found",
        _ => "Server error",
    }
}

// ============================================================================
// Methods and parsed parameters
// ============================================================================

/// One-byte method discriminator on inbound frames.
///
/// Wire values are fixed; the `Unknown` sentinel is represented by
/// [`METHOD_COUNT`] and exists only to bound validation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Method {
    PipelineStart = 0,
    PipelinePause = 1,
    PipelineResume = 2,
    PipelineStop = 3,
}

/// Exclusive upper bound on valid method ids (the `Unknown` sentinel).
pub const METHOD_COUNT: u8 = 4;

impl Method {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::PipelineStart),
            1 => Some(Self::PipelinePause),
            2 => Some(Self::PipelineResume),
            3 => Some(Self::PipelineStop),
            _ => None,
        }
    }

    pub fn wire(self) -> u8 {
        self as u8
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::PipelineStart => "pipelineStart",
            Self::PipelinePause => "pipelinePause",
            Self::PipelineResume => "pipelineResume",
            Self::PipelineStop => "pipelineStop",
        }
    }
}

/// Parsed, validated request parameters.
///
/// Every method has exactly one payload shape, enforced by construction. The
/// start descriptor is kept as a byte range into the originating frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Params {
    Start { descriptor: Range<usize> },
    Pause { pipeline_id: u32 },
    Resume { pipeline_id: u32 },
    Stop { pipeline_id: u32 },
}

impl Params {
    pub fn method(&self) -> Method {
        match self {
            Self::Start { .. } => Method::PipelineStart,
            Self::Pause { .. } => Method::PipelinePause,
            Self::Resume { .. } => Method::PipelineResume,
            Self::Stop { .. } => Method::PipelineStop,
        }
    }
}

/// A validated request header plus parameters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParsedFrame {
    pub req_id: u64,
    pub params: Params,
}

// ============================================================================
// Parse errors
// ============================================================================

/// Rejection reasons for inbound frames.
///
/// Variants carry the request id when the header was readable, so the error
/// response can echo it; otherwise the JSON `id` falls back to `-1`.
#[derive(Clone, Debug, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Frame shorter than the fixed header.
    FrameTooShort { len: usize },
    /// `req_id == 0` is reserved and invalid.
    ZeroRequestId,
    /// Method byte at or above the `Unknown` sentinel.
    UnknownMethod { method_id: u8, req_id: u64 },
    /// Payload length does not match the method's fixed shape.
    BadPayloadLength {
        method: Method,
        len: usize,
        req_id: u64,
    },
    /// Start descriptor is not valid UTF-8.
    DescriptorNotUtf8 { req_id: u64 },
}

impl ParseError {
    /// JSON-RPC error code for this rejection.
    pub fn code(&self) -> i32 {
        match self {
            Self::FrameTooShort { .. } => CODE_PARSE_ERROR,
            Self::ZeroRequestId => CODE_INVALID_REQUEST,
            Self::UnknownMethod { .. } => CODE_METHOD_NOT_FOUND,
            Self::BadPayloadLength { .. } => CODE_PARSE_ERROR,
            Self::DescriptorNotUtf8 { .. } => CODE_PARSE_ERROR,
        }
    }

    /// JSON `id` to report: the client's request id where the header was
    /// readable, `-1` where it was not.
    pub fn response_id(&self) -> i64 {
        match self {
            Self::FrameTooShort { .. } => -1,
            Self::ZeroRequestId => 0,
            Self::UnknownMethod { req_id, .. }
            | Self::BadPayloadLength { req_id, .. }
            | Self::DescriptorNotUtf8 { req_id } => *req_id as i64,
        }
    }
}

impl fmt::Display for ParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::FrameTooShort { len } => {
                write!(f, "frame too short: {len} bytes (header is {HEADER_LEN})")
            }
            Self::ZeroRequestId => write!(f, "request id must be nonzero"),
            Self::UnknownMethod { method_id, .. } => {
                write!(f, "unknown method id {method_id}")
            }
            Self::BadPayloadLength { method, len, .. } => {
                write!(f, "{} payload must be 4 bytes, got {len}", method.name())
            }
            Self::DescriptorNotUtf8 { .. } => {
                write!(f, "pipeline descriptor is not valid UTF-8")
            }
        }
    }
}

impl std::error::Error for ParseError {}

// ============================================================================
// Parse / encode
// ============================================================================

/// Zero-copy parse of an inbound frame.
///
/// The returned offsets are valid only against `frame`.
pub fn parse(frame: &[u8]) -> Result<ParsedFrame, ParseError> {
    if frame.len() < HEADER_LEN {
        return Err(ParseError::FrameTooShort { len: frame.len() });
    }

    let req_id = u64::from_le_bytes(frame[..8].try_into().expect("header length checked"));
    if req_id == 0 {
        return Err(ParseError::ZeroRequestId);
    }

    let method_id = frame[8];
    let Some(method) = Method::from_u8(method_id) else {
        return Err(ParseError::UnknownMethod { method_id, req_id });
    };

    let payload = &frame[HEADER_LEN..];
    let params = match method {
        Method::PipelineStart => {
            if std::str::from_utf8(payload).is_err() {
                return Err(ParseError::DescriptorNotUtf8 { req_id });
            }
            Params::Start {
                descriptor: HEADER_LEN..frame.len(),
            }
        }
        Method::PipelinePause | Method::PipelineResume | Method::PipelineStop => {
            if payload.len() != 4 {
                return Err(ParseError::BadPayloadLength {
                    method,
                    len: payload.len(),
                    req_id,
                });
            }
            let pipeline_id =
                u32::from_le_bytes(payload.try_into().expect("payload length checked"));
            match method {
                Method::PipelinePause => Params::Pause { pipeline_id },
                Method::PipelineResume => Params::Resume { pipeline_id },
                Method::PipelineStop => Params::Stop { pipeline_id },
                Method::PipelineStart => unreachable!("start handled above"),
            }
        }
    };

    Ok(ParsedFrame { req_id, params })
}

/// Canonical wire form of a start request.
pub fn encode_start(req_id: u64, descriptor: &str) -> Vec<u8> {
    let mut frame = Vec::with_capacity(HEADER_LEN + descriptor.len());
    frame.extend_from_slice(&req_id.to_le_bytes());
    frame.push(Method::PipelineStart.wire());
    frame.extend_from_slice(descriptor.as_bytes());
    frame
}

/// Canonical wire form of a stop/pause/resume request.
///
/// # Panics
///
/// Panics if `method` is [`Method::PipelineStart`]; start carries a
/// descriptor, not a pipeline id.
pub fn encode_control(req_id: u64, method: Method, pipeline_id: u32) -> Vec<u8> {
    assert!(
        method != Method::PipelineStart,
        "start frames carry a descriptor"
    );
    let mut frame = Vec::with_capacity(HEADER_LEN + 4);
    frame.extend_from_slice(&req_id.to_le_bytes());
    frame.push(method.wire());
    frame.extend_from_slice(&pipeline_id.to_le_bytes());
    frame
}

// ============================================================================
// FrameBuf
// ============================================================================

/// Inline capacity of an outbound frame buffer. Sized so acks, errors, and
/// typical responses never touch the heap.
pub const FRAME_INLINE_CAP: usize = 1024;

/// Reusable outbound frame buffer.
///
/// Pool records of this type keep formatting off the heap: the JSON envelope
/// is written into the inline array, spilling to a `Vec` only for oversized
/// frames (long error messages, large results).
pub struct FrameBuf {
    len: usize,
    inline: [u8; FRAME_INLINE_CAP],
    spill: Option<Vec<u8>>,
}

impl FrameBuf {
    pub fn new() -> Self {
        Self {
            len: 0,
            inline: [0; FRAME_INLINE_CAP],
            spill: None,
        }
    }

    /// Pool reset hook: empty the buffer before the record is recycled.
    pub fn reset(frame: &mut FrameBuf) {
        frame.clear();
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.spill = None;
    }

    pub fn as_bytes(&self) -> &[u8] {
        match &self.spill {
            Some(v) => v,
            None => &self.inline[..self.len],
        }
    }

    pub fn len(&self) -> usize {
        match &self.spill {
            Some(v) => v.len(),
            None => self.len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn push_bytes(&mut self, bytes: &[u8]) {
        if let Some(spill) = &mut self.spill {
            spill.extend_from_slice(bytes);
            return;
        }
        let new_len = self.len + bytes.len();
        if new_len <= FRAME_INLINE_CAP {
            self.inline[self.len..new_len].copy_from_slice(bytes);
            self.len = new_len;
        } else {
            let mut spill = Vec::with_capacity(new_len.next_power_of_two());
            spill.extend_from_slice(&self.inline[..self.len]);
            spill.extend_from_slice(bytes);
            self.spill = Some(spill);
        }
    }
}

impl Default for FrameBuf {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Write for FrameBuf {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        self.push_bytes(s.as_bytes());
        Ok(())
    }
}

impl fmt::Debug for FrameBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FrameBuf")
            .field("len", &self.len())
            .field("spilled", &self.spill.is_some())
            .finish()
    }
}

// ============================================================================
// JSON-RPC emission
// ============================================================================

/// `{"jsonrpc":"2.0","ack":1,"id":<req_id>}`
pub fn write_ack(buf: &mut FrameBuf, req_id: u64) {
    let _ = write!(buf, "{{\"jsonrpc\":\"2.0\",\"ack\":1,\"id\":{req_id}}}");
}

/// `{"jsonrpc":"2.0","id":<req_id>,"result":<result_json>}`
///
/// `result_json` must already be well-formed JSON; it is embedded verbatim.
pub fn write_response(buf: &mut FrameBuf, req_id: u64, result_json: &str) {
    let _ = write!(
        buf,
        "{{\"jsonrpc\":\"2.0\",\"id\":{req_id},\"result\":{result_json}}}"
    );
}

/// `{"jsonrpc":"2.0","id":<id>,"error":{"code":<code>,"message":"<msg>"}}`
pub fn write_error(buf: &mut FrameBuf, id: i64, code: i32, message: &str) {
    let _ = write!(
        buf,
        "{{\"jsonrpc\":\"2.0\",\"id\":{id},\"error\":{{\"code\":{code},\"message\":\""
    );
    write_escaped(buf, message);
    let _ = buf.write_str("\"}}");
}

/// `{"jsonrpc":"2.0","method":"log","params":{"level":"<l>","message":"<m>"}}`
///
/// Log notifications carry no `id`.
pub fn write_log(buf: &mut FrameBuf, level: &str, message: &str) {
    let _ = buf.write_str("{\"jsonrpc\":\"2.0\",\"method\":\"log\",\"params\":{\"level\":\"");
    write_escaped(buf, level);
    let _ = buf.write_str("\",\"message\":\"");
    write_escaped(buf, message);
    let _ = buf.write_str("\"}}");
}

fn write_escaped(buf: &mut FrameBuf, s: &str) {
    for ch in s.chars() {
        match ch {
            '"' => buf.push_bytes(b"\\\""),
            '\\' => buf.push_bytes(b"\\\\"),
            '\n' => buf.push_bytes(b"\\n"),
            '\r' => buf.push_bytes(b"\\r"),
            '\t' => buf.push_bytes(b"\\t"),
            c if (c as u32) < 0x20 => {
                let _ = write!(buf, "\\u{:04x}", c as u32);
            }
            c => {
                let mut utf8 = [0u8; 4];
                buf.push_bytes(c.encode_utf8(&mut utf8).as_bytes());
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================


#[cfg(all(test, feature = "stdx-proptest"))]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    const PROPTEST_CASES: u32 = 128;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(PROPTEST_CASES))]

        /// Encode → parse → encode is the identity for valid requests.
        #[test]
        fn start_round_trip(req_id in 1u64.., desc in ".{0,128}") {
            let frame = encode_start(req_id, &desc);
            let parsed = parse(&frame).expect("valid frame");
            prop_assert_eq!(parsed.req_id, req_id);
            let Params::Start { descriptor } = parsed.params else {
                return Err(TestCaseError::fail("expected start"));
            };
            prop_assert_eq!(&frame[descriptor], desc.as_bytes());
        }

        #[test]
        fn control_round_trip(
            req_id in 1u64..,
            pipeline_id in any::<u32>(),
            which in 0u8..3,
        ) {
            let method = match which {
                0 => Method::PipelinePause,
                1 => Method::PipelineResume,
                _ => Method::PipelineStop,
            };
            let frame = encode_control(req_id, method, pipeline_id);
            let parsed = parse(&frame).expect("valid frame");
            prop_assert_eq!(parsed.req_id, req_id);
            prop_assert_eq!(parsed.params.method(), method);
        }

        /// Whatever we emit is valid JSON with the message preserved.
        #[test]
        fn escaping_preserves_messages(msg in ".{0,256}") {
            let mut buf = FrameBuf::new();
            write_log(&mut buf, "INFO", &msg);
            let value: serde_json::Value = serde_json::from_slice(buf.as_bytes())
                .expect("emitted JSON must parse");
            prop_assert_eq!(value["params"]["message"].as_str(), Some(msg.as_str()));
        }

        /// Arbitrary bytes never panic the parser.
        #[test]
        fn parse_never_panics(bytes in prop::collection::vec(any::<u8>(), 0..64)) {
            let _ = parse(&bytes);
        }
    }
}

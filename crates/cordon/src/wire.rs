//! Wire codec for the supervisor ↔ runner protocol.
//!
//! Two small codecs live here:
//! - an integer ↔ ASCII-digit codec (bases 2..=16) used to pass pipe
//!   descriptors across the `exec` boundary through the environment;
//! - the command and response frame encodings exchanged over the control
//!   pipes.
//!
//! Frames are self-delimiting little-endian records: a fixed header whose
//! last field is the length of the optional UTF-8 message payload, so both
//! sides read them with nothing but exact-length reads.

use thiserror::Error;

use crate::fault;

const DIGITS: &[u8; 16] = b"0123456789abcdef";

/// Codec failure. Decoding runs on bytes produced by the harness itself, so
/// any of these indicates a corrupted channel rather than user error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum WireError {
    /// A character outside the alphabet of the requested base.
    #[error("invalid digit {digit:?} for base {base}")]
    InvalidDigit { digit: char, base: u8 },

    /// The decoded value does not fit the target width.
    #[error("integer overflow decoding base-{base} string")]
    Overflow { base: u8 },

    /// An unknown response code byte.
    #[error("unknown response code {0:#04x}")]
    UnknownCode(u8),

    /// A header shorter than the fixed layout.
    #[error("truncated frame header: {actual} bytes, expected {expected}")]
    TruncatedHeader { actual: usize, expected: usize },
}

// ---------------------------------------------------------------------------
// Integer codec — descriptor passing across exec
// ---------------------------------------------------------------------------

/// Encodes `value` in the given base (2..=16), lowercase digits.
pub(crate) fn encode_int(value: u64, base: u8) -> String {
    fault::contract(
        (2..=16).contains(&base),
        "integer codec base must be between 2 and 16, inclusive",
    );

    if value == 0 {
        return "0".to_string();
    }

    let base = u64::from(base);
    let mut digits = Vec::new();
    let mut rest = value;
    while rest > 0 {
        digits.push(DIGITS[(rest % base) as usize]);
        rest /= base;
    }
    digits.reverse();

    // Digits come from a fixed ASCII alphabet.
    String::from_utf8(digits).unwrap_or_else(|_| fault::contract_violation("non-ASCII digit"))
}

/// Decodes a string produced by [`encode_int`] with the same base.
pub(crate) fn decode_int(input: &str, base: u8) -> Result<u64, WireError> {
    fault::contract(
        (2..=16).contains(&base),
        "integer codec base must be between 2 and 16, inclusive",
    );

    let mut value: u64 = 0;
    for c in input.chars() {
        let digit = DIGITS
            .iter()
            .position(|d| char::from(*d) == c)
            .filter(|idx| *idx < usize::from(base))
            .ok_or(WireError::InvalidDigit { digit: c, base })?;

        value = value
            .checked_mul(u64::from(base))
            .and_then(|v| v.checked_add(digit as u64))
            .ok_or(WireError::Overflow { base })?;
    }

    Ok(value)
}

// ---------------------------------------------------------------------------
// Command frame — supervisor → runner
// ---------------------------------------------------------------------------

/// Size of a command frame on the wire.
pub(crate) const COMMAND_FRAME_LEN: usize = 8;

/// Encodes the "execute this test" command.
pub(crate) fn encode_command(test_id: u64) -> [u8; COMMAND_FRAME_LEN] {
    test_id.to_le_bytes()
}

/// Decodes a command frame.
pub(crate) fn decode_command(bytes: &[u8; COMMAND_FRAME_LEN]) -> u64 {
    u64::from_le_bytes(*bytes)
}

// ---------------------------------------------------------------------------
// Response frames — runner → supervisor
// ---------------------------------------------------------------------------

/// Discriminates the three response frames the runner emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ResponseCode {
    /// One assertion was evaluated inside the running test body.
    AssertionResult,
    /// The test body returned normally; terminal frame.
    TestFinished,
    /// The test body unwound before finishing; terminal frame.
    TestAbortedBeforeFinish,
}

impl ResponseCode {
    fn as_u8(self) -> u8 {
        match self {
            Self::AssertionResult => 0,
            Self::TestFinished => 1,
            Self::TestAbortedBeforeFinish => 2,
        }
    }

    fn from_u8(raw: u8) -> Result<Self, WireError> {
        match raw {
            0 => Ok(Self::AssertionResult),
            1 => Ok(Self::TestFinished),
            2 => Ok(Self::TestAbortedBeforeFinish),
            other => Err(WireError::UnknownCode(other)),
        }
    }
}

/// Fixed-size portion of a response frame:
/// `u8 code | u64 test_id | u8 passed | u64 assertion_index | u64 msg_len`.
pub(crate) const RESPONSE_HEADER_LEN: usize = 1 + 8 + 1 + 8 + 8;

/// Decoded response header. The message payload, if any, follows on the
/// wire as `message_len` UTF-8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ResponseHeader {
    pub(crate) code: ResponseCode,
    pub(crate) test_id: u64,
    pub(crate) assertion_passed: bool,
    pub(crate) assertion_index: u64,
    pub(crate) message_len: u64,
}

impl ResponseHeader {
    pub(crate) fn decode(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < RESPONSE_HEADER_LEN {
            return Err(WireError::TruncatedHeader {
                actual: bytes.len(),
                expected: RESPONSE_HEADER_LEN,
            });
        }

        let code = ResponseCode::from_u8(bytes[0])?;
        let test_id = u64::from_le_bytes(take8(&bytes[1..9]));
        let assertion_passed = bytes[9] != 0;
        let assertion_index = u64::from_le_bytes(take8(&bytes[10..18]));
        let message_len = u64::from_le_bytes(take8(&bytes[18..26]));

        Ok(Self {
            code,
            test_id,
            assertion_passed,
            assertion_index,
            message_len,
        })
    }
}

fn take8(slice: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(slice);
    out
}

/// One complete response frame, ready to encode or freshly decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ResponseFrame {
    pub(crate) code: ResponseCode,
    pub(crate) test_id: u64,
    pub(crate) assertion_passed: bool,
    pub(crate) assertion_index: u64,
    pub(crate) message: Option<String>,
}

impl ResponseFrame {
    /// Frame for a single evaluated assertion. The message carries the
    /// failure diagnostic; `None` encodes as a zero-length payload.
    pub(crate) fn assertion(
        test_id: u64,
        passed: bool,
        index: u64,
        message: Option<&str>,
    ) -> Self {
        Self {
            code: ResponseCode::AssertionResult,
            test_id,
            assertion_passed: passed,
            assertion_index: index,
            message: message.map(str::to_owned),
        }
    }

    /// Terminal frame for a body that returned normally.
    pub(crate) fn finished(test_id: u64) -> Self {
        Self {
            code: ResponseCode::TestFinished,
            test_id,
            assertion_passed: false,
            assertion_index: 0,
            message: None,
        }
    }

    /// Terminal frame for a body that unwound before finishing.
    pub(crate) fn aborted(test_id: u64) -> Self {
        Self {
            code: ResponseCode::TestAbortedBeforeFinish,
            test_id,
            assertion_passed: false,
            assertion_index: 0,
            message: None,
        }
    }

    pub(crate) fn encode(&self) -> Vec<u8> {
        let message = self.message.as_deref().unwrap_or("");
        let mut out = Vec::with_capacity(RESPONSE_HEADER_LEN + message.len());
        out.push(self.code.as_u8());
        out.extend_from_slice(&self.test_id.to_le_bytes());
        out.push(u8::from(self.assertion_passed));
        out.extend_from_slice(&self.assertion_index.to_le_bytes());
        out.extend_from_slice(&(message.len() as u64).to_le_bytes());
        out.extend_from_slice(message.as_bytes());
        out
    }

    /// Reassembles a frame from its decoded header and message payload.
    pub(crate) fn from_parts(header: ResponseHeader, message: Option<String>) -> Self {
        Self {
            code: header.code,
            test_id: header.test_id,
            assertion_passed: header.assertion_passed,
            assertion_index: header.assertion_index,
            message,
        }
    }
}

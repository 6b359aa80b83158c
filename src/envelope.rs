//! Wire envelope handling
//!
//! Registry-aware producers prefix every Avro datum with a 5-byte header:
//!
//! ```text
//! +------+----------------------+------------------+
//! | 0x00 | schema id (u32, BE)  | avro binary ...  |
//! +------+----------------------+------------------+
//!   1 B          4 B               len - 5 B
//! ```
//!
//! Framing is inferred from the bytes themselves. Anything that does not start with
//! the magic byte, or is too short to hold a header, is treated as a bare datum.

/// Magic byte opening a framed message
pub const MAGIC_BYTE: u8 = 0x00;

/// Length of the framing header in bytes
pub const HEADER_LEN: usize = 5;

/// A raw message split into its optional schema id and Avro payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramedMessage<'a> {
    /// Writer schema id from the header, if the buffer was framed
    pub schema_id: Option<u32>,
    /// Avro binary payload
    pub payload: &'a [u8],
}

impl<'a> FramedMessage<'a> {
    /// Whether the buffer carried a framing header
    pub fn is_framed(&self) -> bool {
        self.schema_id.is_some()
    }
}

/// Split a raw buffer into header and payload
///
/// Never fails: a buffer that is not framed comes back whole with no schema id.
pub fn strip(raw: &[u8]) -> FramedMessage<'_> {
    if raw.len() >= HEADER_LEN && raw[0] == MAGIC_BYTE {
        let schema_id = u32::from_be_bytes([raw[1], raw[2], raw[3], raw[4]]);
        FramedMessage {
            schema_id: Some(schema_id),
            payload: &raw[HEADER_LEN..],
        }
    } else {
        FramedMessage {
            schema_id: None,
            payload: raw,
        }
    }
}

/// Prefix an Avro payload with the framing header for `schema_id`
pub fn frame(schema_id: u32, payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(HEADER_LEN + payload.len());
    framed.push(MAGIC_BYTE);
    framed.extend_from_slice(&schema_id.to_be_bytes());
    framed.extend_from_slice(payload);
    framed
}

//! Incremental unit framing.
//!
//! A client unit is a 3-byte little-endian payload length, a 1-byte
//! sequence number, then that many payload bytes. Backend replies carry
//! an additional fixed correlation header in front of the unit: the
//! originating message id as 8 little-endian bytes, which lets responses
//! be matched out of order.
//!
//! The parsers here are purely synchronous and never block: the caller
//! reads from the network into a buffer and retries once more data
//! arrives. An under-full buffer yields `Ok(None)`, never an error.
//! Payload bytes are returned as zero-copy `Bytes::slice()` into the
//! receive buffer.

use bytes::Bytes;

use crate::error::ProtocolError;

/// Size of the length + sequence unit header.
pub const UNIT_HEADER_SIZE: usize = 4;

/// Size of the backend correlation header (message id, little-endian).
pub const CORRELATION_HEADER_SIZE: usize = 8;

/// Maximum accepted payload length for one unit (1 MiB).
///
/// Well below the 16 MiB the 3-byte length field could express: the
/// proxy never relays multi-unit payload continuations, so anything
/// this large is malformed input, not backpressure, and the connection
/// that sent it is torn down.
pub const MAX_UNIT_PAYLOAD: usize = 1 << 20;

/// One parsed protocol unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unit {
    /// Sequence number from the unit header.
    pub seq: u8,
    /// Payload bytes, sliced zero-copy out of the receive buffer.
    pub payload: Bytes,
}

impl Unit {
    /// Total encoded size of this unit on the wire.
    pub fn wire_len(&self) -> usize {
        UNIT_HEADER_SIZE + self.payload.len()
    }

    /// Whether the unit carries no payload at all.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// A backend reply: correlation header plus the relayed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendReply {
    /// Message id of the request this reply answers.
    pub id: u64,
    /// The reply unit, relayed verbatim to the client.
    pub unit: Unit,
}

/// Parses one client unit from the front of `buf`.
///
/// Returns `Ok(Some((unit, consumed)))` when a complete unit is
/// available, `Ok(None)` when more data is needed, or an error when the
/// declared payload length is malformed. The caller advances its buffer
/// by `consumed` and may call again immediately: the parser consumes
/// exactly one unit per call, leaving the cursor at the start of the
/// next unit.
pub fn parse_unit(buf: &Bytes) -> Result<Option<(Unit, usize)>, ProtocolError> {
    if buf.len() < UNIT_HEADER_SIZE {
        return Ok(None);
    }

    let len = u32::from(buf[0]) | (u32::from(buf[1]) << 8) | (u32::from(buf[2]) << 16);
    let len = len as usize;
    if len > MAX_UNIT_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge(len));
    }

    let total = UNIT_HEADER_SIZE + len;
    if buf.len() < total {
        return Ok(None);
    }

    let unit = Unit {
        seq: buf[3],
        payload: buf.slice(UNIT_HEADER_SIZE..total),
    };
    Ok(Some((unit, total)))
}

/// Parses one correlation-framed backend reply from the front of `buf`.
///
/// Same incremental contract as [`parse_unit`]; the `consumed` count
/// includes the correlation header.
pub fn parse_reply(buf: &Bytes) -> Result<Option<(BackendReply, usize)>, ProtocolError> {
    if buf.len() < CORRELATION_HEADER_SIZE {
        return Ok(None);
    }

    let mut id_bytes = [0u8; 8];
    id_bytes.copy_from_slice(&buf[..CORRELATION_HEADER_SIZE]);
    let id = u64::from_le_bytes(id_bytes);

    let rest = buf.slice(CORRELATION_HEADER_SIZE..);
    match parse_unit(&rest)? {
        Some((unit, consumed)) => Ok(Some((
            BackendReply { id, unit },
            CORRELATION_HEADER_SIZE + consumed,
        ))),
        None => Ok(None),
    }
}

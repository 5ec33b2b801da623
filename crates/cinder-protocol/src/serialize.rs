//! Direct-to-buffer serialization of units and synthesized replies.

use bytes::{BufMut, BytesMut};

use crate::unit::Unit;

/// Writes a unit header + payload into `buf`.
///
/// The payload length must fit the 3-byte length field; callers only
/// ever serialize payloads they parsed or synthesized, both of which
/// are bounded well below that.
pub fn write_unit(buf: &mut BytesMut, seq: u8, payload: &[u8]) {
    debug_assert!(payload.len() < (1 << 24));
    let len = payload.len() as u32;
    buf.put_u8(len as u8);
    buf.put_u8((len >> 8) as u8);
    buf.put_u8((len >> 16) as u8);
    buf.put_u8(seq);
    buf.put_slice(payload);
}

/// Writes a fixed OK acknowledgment unit.
///
/// Payload layout: OK marker, zero affected rows, zero insert id,
/// autocommit status flag, zero warnings.
pub fn ok_unit(buf: &mut BytesMut, seq: u8) {
    write_unit(buf, seq, &[0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]);
}

/// Writes an error unit carrying `errno` and a human-readable message.
pub fn err_unit(buf: &mut BytesMut, seq: u8, errno: u16, msg: &str) {
    let mut payload = Vec::with_capacity(9 + msg.len());
    payload.push(0xFF);
    payload.extend_from_slice(&errno.to_le_bytes());
    payload.push(b'#');
    payload.extend_from_slice(b"HY000");
    payload.extend_from_slice(msg.as_bytes());
    write_unit(buf, seq, &payload);
}

/// Encodes a request unit for the backend link: the correlation header
/// (message id, little-endian) followed by the unit itself.
pub fn encode_forward(buf: &mut BytesMut, id: u64, unit: &Unit) {
    buf.put_slice(&id.to_le_bytes());
    write_unit(buf, unit.seq, &unit.payload);
}

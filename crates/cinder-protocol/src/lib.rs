//! cinder-protocol: MySQL-framed wire protocol for the cinder proxy.
//!
//! Provides incremental, zero-copy parsing of client units and
//! correlation-framed backend replies, command classification, typed
//! routing-key decoding, and direct-to-buffer serialization of
//! synthesized replies.
//!
//! # quick start
//!
//! ```
//! use bytes::{Bytes, BytesMut};
//! use cinder_protocol::{parse_unit, serialize};
//!
//! // parse one unit: 3-byte LE length, 1-byte sequence, payload
//! let input = Bytes::from_static(b"\x03\x00\x00\x01\x0e\x00\x00");
//! let (unit, consumed) = parse_unit(&input).unwrap().unwrap();
//! assert_eq!(unit.seq, 1);
//! assert_eq!(consumed, 7);
//!
//! // synthesize the OK reply for it
//! let mut buf = BytesMut::new();
//! serialize::ok_unit(&mut buf, unit.seq.wrapping_add(1));
//! ```

pub mod command;
pub mod error;
pub mod key;
pub mod serialize;
pub mod unit;

pub use command::{Command, Dispatch};
pub use error::ProtocolError;
pub use key::{decode_value, extract_sql_key, KeyType, KeyValue};
pub use unit::{parse_reply, parse_unit, BackendReply, Unit};

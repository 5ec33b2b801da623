//! Key canonicalization and shard selection.
//!
//! A request routes by its single extracted key: the key bytes are
//! canonicalized by type, digested, and located on the pool's
//! continuum. Commands that carry no key material of their own draw a
//! synthetic key from a per-process counter so non-keyed traffic still
//! spreads across backends. Multi-key requests cannot be split and
//! fail fragmentation outright.

use std::sync::atomic::{AtomicU64, Ordering};

use cinder_protocol::{decode_value, KeyType, KeyValue};
use thiserror::Error;

use crate::continuum::Continuum;
use crate::error::RelayError;
use crate::hashkit::HashKind;
use crate::message::Message;

/// Why a request could not be routed.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RouteError {
    /// No key on a command that needs one.
    #[error("request without key")]
    NoKey,
    /// More than one key; splitting across backends is unsupported.
    #[error("multi-key request cannot be fragmented")]
    MultiKey,
    /// The key bytes failed typed decoding.
    #[error("key value failed to decode")]
    BadKey,
}

impl From<RouteError> for RelayError {
    fn from(e: RouteError) -> Self {
        match e {
            RouteError::NoKey | RouteError::BadKey => RelayError::NoKey,
            RouteError::MultiKey => RelayError::Fragment,
        }
    }
}

/// Selects a backend index for `msg` and records it on the message.
///
/// `synth` is the per-process synthetic-key counter used for commands
/// in the no-key routing class.
pub fn route_key(
    msg: &mut Message,
    kind: HashKind,
    continuum: &Continuum,
    synth: &AtomicU64,
) -> Result<u16, RouteError> {
    if msg.command.routes_without_key() {
        let synthetic = synth.fetch_add(1, Ordering::Relaxed);
        let backend = continuum.locate(kind.digest(&synthetic.to_le_bytes()));
        msg.backend = Some(backend);
        return Ok(backend);
    }

    match msg.keys.len() {
        0 => Err(RouteError::NoKey),
        1 => {
            let (range, key_type) = msg.keys[0].clone();
            let raw = &msg.payload[range];
            let backend = match key_type {
                KeyType::Signed | KeyType::Unsigned => {
                    let KeyValue::Unsigned(v) = decode_value(KeyType::Unsigned, raw)
                        .map_err(|_| RouteError::BadKey)?
                    else {
                        unreachable!("unsigned decode yields unsigned");
                    };
                    continuum.locate(kind.digest(&v.to_le_bytes()))
                }
                KeyType::String => {
                    // length byte + case-folded bytes
                    let mut buf = Vec::with_capacity(raw.len() + 1);
                    buf.push(raw.len() as u8);
                    buf.extend(raw.iter().map(u8::to_ascii_lowercase));
                    continuum.locate(kind.digest(&buf))
                }
                KeyType::Binary | KeyType::Float => {
                    // length byte + verbatim bytes
                    let mut buf = Vec::with_capacity(raw.len() + 1);
                    buf.push(raw.len() as u8);
                    buf.extend_from_slice(raw);
                    continuum.locate(kind.digest(&buf))
                }
            };
            msg.backend = Some(backend);
            Ok(backend)
        }
        _ => Err(RouteError::MultiKey),
    }
}

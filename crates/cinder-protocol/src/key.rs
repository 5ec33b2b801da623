//! Typed routing-key decoding and SQL key-position extraction.
//!
//! Keys arrive in two shapes: a byte range inside a statement's text
//! (located by [`extract_sql_key`]) and a type tag from the table schema
//! that says how to interpret those bytes ([`decode_value`]).

use std::ops::Range;

use bytes::Bytes;
use thiserror::Error;

use crate::error::ProtocolError;

/// Schema type tag for a key field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    Signed,
    Unsigned,
    Float,
    String,
    Binary,
}

/// A decoded key value.
#[derive(Debug, Clone, PartialEq)]
pub enum KeyValue {
    Signed(i64),
    Unsigned(u64),
    Float(f64),
    /// Text key. Always a real (possibly empty) value, never a null.
    Str(Bytes),
    /// Binary key. Always a real (possibly empty) value, never a null.
    Bin(Bytes),
}

/// Why no key range could be extracted from a statement.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum KeyExtractError {
    /// The configured key field name does not appear in the statement.
    #[error("key field not present in statement")]
    FieldMissing,
    /// The field name appears but is not followed by `=`.
    #[error("key field has no `=` comparison")]
    EqualsMissing,
    /// `=` is present but no value follows it.
    #[error("key comparison has no value")]
    ValueMissing,
}

/// Decodes the raw bytes of a key according to its schema type.
///
/// Integers are big-endian byte-packed, 1 to 8 bytes, sign-extended
/// from the leading byte. Strings and binaries require a trailing NUL
/// (validated here, stripped from the value); a zero-length encoding
/// decodes to an explicit empty value. Floats are NUL-terminated text
/// accepting the `NAN` / `INF` / `-INF` spellings.
pub fn decode_value(ty: KeyType, raw: &[u8]) -> Result<KeyValue, ProtocolError> {
    match ty {
        KeyType::Signed | KeyType::Unsigned => {
            if raw.is_empty() || raw.len() > 8 {
                return Err(ProtocolError::BadIntegerLength(raw.len()));
            }
            // sign-extend from the first byte, then shift in the rest
            let mut v = i64::from(raw[0] as i8);
            for &b in &raw[1..] {
                v = (v << 8) | i64::from(b);
            }
            if ty == KeyType::Signed {
                Ok(KeyValue::Signed(v))
            } else {
                Ok(KeyValue::Unsigned(v as u64))
            }
        }
        KeyType::Float => {
            if raw.len() < 3 {
                return Err(ProtocolError::BadFloat);
            }
            if raw[raw.len() - 1] != 0 {
                return Err(ProtocolError::MissingNul);
            }
            let text =
                std::str::from_utf8(&raw[..raw.len() - 1]).map_err(|_| ProtocolError::BadFloat)?;
            let value = match text {
                "NAN" => f64::NAN,
                "INF" => f64::INFINITY,
                "-INF" => f64::NEG_INFINITY,
                other => other.parse().map_err(|_| ProtocolError::BadFloat)?,
            };
            Ok(KeyValue::Float(value))
        }
        KeyType::String | KeyType::Binary => {
            let value = if raw.is_empty() {
                Bytes::new()
            } else {
                if raw[raw.len() - 1] != 0 {
                    return Err(ProtocolError::MissingNul);
                }
                Bytes::copy_from_slice(&raw[..raw.len() - 1])
            };
            if ty == KeyType::String {
                Ok(KeyValue::Str(value))
            } else {
                Ok(KeyValue::Bin(value))
            }
        }
    }
}

/// Locates the key value inside a SQL statement's text.
///
/// Scans for the first occurrence of `field`, then for an `=` after it,
/// skips spaces, and takes bytes up to the next space, `;`, or end of
/// statement. Returns the byte range of the value within `sql`.
pub fn extract_sql_key(sql: &[u8], field: &[u8]) -> Result<Range<usize>, KeyExtractError> {
    if field.is_empty() {
        return Err(KeyExtractError::FieldMissing);
    }
    let pos = memchr::memmem::find(sql, field).ok_or(KeyExtractError::FieldMissing)?;

    // find the `=` following the field name
    let mut j = pos + field.len();
    loop {
        if j >= sql.len() {
            return Err(KeyExtractError::EqualsMissing);
        }
        if sql[j] == b'=' {
            j += 1;
            break;
        }
        j += 1;
    }

    // strip spaces between `=` and the value
    while j < sql.len() && sql[j] == b' ' {
        j += 1;
    }
    if j >= sql.len() {
        return Err(KeyExtractError::ValueMissing);
    }

    // value runs until the next space, `;`, or end of statement
    let start = j;
    let mut end = sql.len();
    for k in start..sql.len() {
        if sql[k] == b' ' || sql[k] == b';' {
            end = k;
            break;
        }
    }
    Ok(start..end)
}

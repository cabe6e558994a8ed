//
// Copyright 2026 YBRPC Project Authors. All Rights Reserved.
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.
//

//! Low-level varint and tagged-field primitives for the wire headers.
//!
//! Headers on the wire are protobuf-like records: a sequence of
//! `(key, value)` pairs where the key packs a field tag and a wire type.
//! Only two wire types exist here: varint scalars and length-delimited
//! byte ranges. Unknown fields are skipped so headers can grow.

use bytes::{BufMut, BytesMut};

use crate::error::{Result, RpcError};

/// Wire type of a varint-encoded scalar field.
pub(crate) const WIRE_TYPE_VARINT: u8 = 0;
/// Wire type of a length-delimited field.
pub(crate) const WIRE_TYPE_LEN: u8 = 2;

const MAX_VARINT_LEN: usize = 10;

/// Appends `value` to `buf` as an unsigned LEB128 varint.
pub(crate) fn put_varint(buf: &mut BytesMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            buf.put_u8(byte);
            return;
        }
        buf.put_u8(byte | 0x80);
    }
}

/// Number of bytes [`put_varint`] will write for `value`.
pub(crate) fn varint_len(value: u64) -> usize {
    let bits = 64 - (value | 1).leading_zeros() as usize;
    bits.div_ceil(7)
}

/// Reads a varint from the front of `data`, advancing the slice.
///
/// Truncated or over-long encodings yield [`RpcError::Corruption`].
pub(crate) fn get_varint(data: &mut &[u8]) -> Result<u64> {
    let mut value: u64 = 0;
    for i in 0..MAX_VARINT_LEN {
        let Some(&byte) = data.get(i) else {
            return Err(RpcError::Corruption("truncated varint".to_string()));
        };
        value |= u64::from(byte & 0x7f) << (7 * i);
        if byte & 0x80 == 0 {
            *data = &data[i + 1..];
            return Ok(value);
        }
    }
    Err(RpcError::Corruption("varint exceeds 10 bytes".to_string()))
}

/// Appends a field key for `tag` with the given wire type.
pub(crate) fn put_key(buf: &mut BytesMut, tag: u32, wire_type: u8) {
    put_varint(buf, (u64::from(tag) << 3) | u64::from(wire_type));
}

/// Size of the key for `tag` (independent of wire type for small tags).
pub(crate) fn key_len(tag: u32) -> usize {
    varint_len(u64::from(tag) << 3)
}

/// Reads a field key, returning `(tag, wire_type)`.
pub(crate) fn get_key(data: &mut &[u8]) -> Result<(u32, u8)> {
    let key = get_varint(data)?;
    let tag = (key >> 3) as u32;
    let wire_type = (key & 0x7) as u8;
    Ok((tag, wire_type))
}

/// Appends a varint scalar field.
pub(crate) fn put_varint_field(buf: &mut BytesMut, tag: u32, value: u64) {
    put_key(buf, tag, WIRE_TYPE_VARINT);
    put_varint(buf, value);
}

/// Size of a varint scalar field including its key.
pub(crate) fn varint_field_len(tag: u32, value: u64) -> usize {
    key_len(tag) + varint_len(value)
}

/// Appends a length-delimited field.
pub(crate) fn put_len_field(buf: &mut BytesMut, tag: u32, value: &[u8]) {
    put_key(buf, tag, WIRE_TYPE_LEN);
    put_varint(buf, value.len() as u64);
    buf.put_slice(value);
}

/// Size of a length-delimited field including its key and length prefix.
pub(crate) fn len_field_len(tag: u32, value_len: usize) -> usize {
    key_len(tag) + varint_len(value_len as u64) + value_len
}

/// Reads the payload of a length-delimited field, advancing the slice.
pub(crate) fn get_len_payload<'a>(data: &mut &'a [u8]) -> Result<&'a [u8]> {
    let len = get_varint(data)? as usize;
    if len > data.len() {
        return Err(RpcError::Corruption(format!(
            "length-delimited field of {len} bytes overruns buffer of {}",
            data.len()
        )));
    }
    let (payload, rest) = data.split_at(len);
    *data = rest;
    Ok(payload)
}

/// Skips over a field of the given wire type.
pub(crate) fn skip_field(data: &mut &[u8], wire_type: u8) -> Result<()> {
    match wire_type {
        WIRE_TYPE_VARINT => {
            get_varint(data)?;
        }
        WIRE_TYPE_LEN => {
            get_len_payload(data)?;
        }
        other => {
            return Err(RpcError::Corruption(format!(
                "unsupported wire type {other}"
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_varint_round_trip() {
        for value in [0u64, 1, 127, 128, 300, 16_383, 16_384, u32::MAX as u64, u64::MAX] {
            let mut buf = BytesMut::new();
            put_varint(&mut buf, value);
            assert_eq!(buf.len(), varint_len(value), "length for {value}");
            let mut slice = &buf[..];
            assert_eq!(get_varint(&mut slice).unwrap(), value);
            assert!(slice.is_empty());
        }
    }

    #[test]
    fn test_varint_truncated() {
        let mut slice: &[u8] = &[0x80, 0x80];
        assert!(matches!(
            get_varint(&mut slice),
            Err(RpcError::Corruption(_))
        ));
    }

    #[test]
    fn test_varint_overlong() {
        let mut slice: &[u8] = &[0xff; 11];
        assert!(matches!(
            get_varint(&mut slice),
            Err(RpcError::Corruption(_))
        ));
    }

    #[test]
    fn test_len_field_round_trip() {
        let mut buf = BytesMut::new();
        put_len_field(&mut buf, 2, b"hello");
        assert_eq!(buf.len(), len_field_len(2, 5));

        let mut slice = &buf[..];
        let (tag, wire_type) = get_key(&mut slice).unwrap();
        assert_eq!((tag, wire_type), (2, WIRE_TYPE_LEN));
        assert_eq!(get_len_payload(&mut slice).unwrap(), b"hello");
    }

    #[test]
    fn test_len_payload_overrun() {
        let mut buf = BytesMut::new();
        put_varint(&mut buf, 100);
        buf.put_slice(b"short");
        let mut slice = &buf[..];
        assert!(matches!(
            get_len_payload(&mut slice),
            Err(RpcError::Corruption(_))
        ));
    }

    #[test]
    fn test_skip_unknown_fields() {
        let mut buf = BytesMut::new();
        put_varint_field(&mut buf, 9, 42);
        put_len_field(&mut buf, 10, b"ignored");
        put_varint_field(&mut buf, 1, 7);

        let mut slice = &buf[..];
        loop {
            let (tag, wire_type) = get_key(&mut slice).unwrap();
            if tag == 1 {
                assert_eq!(get_varint(&mut slice).unwrap(), 7);
                break;
            }
            skip_field(&mut slice, wire_type).unwrap();
        }
        assert!(slice.is_empty());
    }
}

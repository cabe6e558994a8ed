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

//! Framing for the YB wire protocol.
//!
//! Every message travels as:
//!
//! ```text
//! +--------------------------+----------------------------------------------+
//! | length (4 bytes, BE u32) | payload (length bytes)                       |
//! +--------------------------+----------------------------------------------+
//! payload = [varint header_len][header][varint body_len][body][sidecars...]
//! ```
//!
//! The length prefix excludes itself. `body_len` covers the main message
//! plus every sidecar; sidecar offsets recorded in the header are measured
//! from the start of the body, not from the frame.
//!
//! [`extract_frame`] consumes as many complete frames as a receive buffer
//! holds, leaving partial frames unconsumed, and rejects frames larger than
//! the configured maximum with [`RpcError::Network`]; the caller must tear
//! the connection down.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{Result, RpcError};
use crate::protocol::header::{RequestHeader, ResponseHeader};
use crate::protocol::wire;

/// Size of the frame length prefix.
pub const MSG_LENGTH_PREFIX_LEN: usize = 4;

/// An opaque message encoder: anything that knows its serialized size and
/// can append itself to a buffer.
///
/// Generated protobuf types sit behind this trait in a full deployment;
/// here it is implemented for raw byte slices and for
/// [`ErrorStatus`](crate::ErrorStatus).
pub trait RpcMessage {
    /// Exact number of bytes [`RpcMessage::serialize`] will append.
    fn byte_size(&self) -> usize;

    /// Appends the serialized message to `buf`.
    fn serialize(&self, buf: &mut BytesMut);
}

impl RpcMessage for [u8] {
    fn byte_size(&self) -> usize {
        self.len()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

impl RpcMessage for Bytes {
    fn byte_size(&self) -> usize {
        self.len()
    }

    fn serialize(&self, buf: &mut BytesMut) {
        buf.put_slice(self);
    }
}

/// Extracts the next complete frame payload from `buf`, advancing past it.
///
/// Returns `Ok(None)` when the buffer holds no complete frame (partial
/// bytes stay in place). A frame whose total size, prefix included, exceeds
/// `max_message_size` yields [`RpcError::Network`]; the connection must be
/// torn down since the stream can no longer be trusted.
///
/// # Examples
///
/// ```rust
/// use bytes::{BufMut, BytesMut};
/// use ybrpc::protocol::extract_frame;
///
/// let mut buf = BytesMut::new();
/// buf.put_u32(5);
/// buf.put_slice(b"hello");
/// buf.put_u32(99); // partial second frame
///
/// let frame = extract_frame(&mut buf, 1024).unwrap().unwrap();
/// assert_eq!(&frame[..], b"hello");
/// assert!(extract_frame(&mut buf, 1024).unwrap().is_none());
/// assert_eq!(buf.len(), 4);
/// ```
pub fn extract_frame(buf: &mut BytesMut, max_message_size: usize) -> Result<Option<Bytes>> {
    if buf.len() < MSG_LENGTH_PREFIX_LEN {
        return Ok(None);
    }
    let payload_len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let total_len = payload_len + MSG_LENGTH_PREFIX_LEN;
    if total_len > max_message_size {
        return Err(RpcError::Network(format!(
            "the frame had a length of {total_len}, but we only support messages up to \
             {max_message_size} bytes long"
        )));
    }
    if buf.len() < total_len {
        return Ok(None);
    }
    buf.advance(MSG_LENGTH_PREFIX_LEN);
    Ok(Some(buf.split_to(payload_len).freeze()))
}

/// Serializes an outbound call into a single wire frame.
pub fn serialize_request(
    call_id: i32,
    remote_method: &crate::protocol::RemoteMethod,
    timeout_millis: u32,
    body: &dyn RpcMessage,
) -> Bytes {
    let header = RequestHeader {
        call_id,
        remote_method: remote_method.clone(),
        timeout_millis,
    };
    let mut buf = BytesMut::new();
    write_call(&mut buf, header.encoded_len(), |b| header.encode(b), body, &[]);
    buf.freeze()
}

/// Serializes a call response into a single wire frame.
///
/// When `is_error` is set, `msg` should be an
/// [`ErrorStatus`](crate::ErrorStatus); sidecars are appended after the
/// message either way. Offsets are computed here (the first sidecar sits
/// right after the serialized message, each subsequent one after its
/// predecessor) and recorded in the header, measured from the start of
/// the body.
pub fn serialize_response(
    call_id: i32,
    msg: &dyn RpcMessage,
    sidecars: &[Bytes],
    is_error: bool,
) -> Bytes {
    let header = ResponseHeader {
        call_id,
        is_error,
        sidecar_offsets: sidecar_offsets(msg.byte_size(), sidecars),
    };
    let mut buf = BytesMut::new();
    write_call(&mut buf, header.encoded_len(), |b| header.encode(b), msg, sidecars);
    buf.freeze()
}

fn sidecar_offsets(msg_size: usize, sidecars: &[Bytes]) -> Vec<u32> {
    let mut offsets = Vec::with_capacity(sidecars.len());
    let mut offset = msg_size as u32;
    for sidecar in sidecars {
        offsets.push(offset);
        offset += sidecar.len() as u32;
    }
    offsets
}

fn write_call(
    buf: &mut BytesMut,
    header_len: usize,
    encode_header: impl FnOnce(&mut BytesMut),
    msg: &dyn RpcMessage,
    sidecars: &[Bytes],
) {
    let body_len = msg.byte_size() + sidecars.iter().map(Bytes::len).sum::<usize>();
    let payload_len = wire::varint_len(header_len as u64)
        + header_len
        + wire::varint_len(body_len as u64)
        + body_len;

    buf.reserve(MSG_LENGTH_PREFIX_LEN + payload_len);
    buf.put_u32(payload_len as u32);
    wire::put_varint(buf, header_len as u64);
    encode_header(buf);
    wire::put_varint(buf, body_len as u64);
    msg.serialize(buf);
    for sidecar in sidecars {
        buf.put_slice(sidecar);
    }
}

/// Parses a frame payload as an inbound request, returning the header and
/// the serialized request message.
pub fn parse_request(payload: &Bytes) -> Result<(RequestHeader, Bytes)> {
    let (header_bytes, body) = split_payload(payload)?;
    Ok((RequestHeader::decode(&header_bytes)?, body))
}

/// Parses a frame payload as a call response.
pub fn parse_response(payload: &Bytes) -> Result<(ResponseHeader, Bytes)> {
    let (header_bytes, body) = split_payload(payload)?;
    Ok((ResponseHeader::decode(&header_bytes)?, body))
}

fn split_payload(payload: &Bytes) -> Result<(Bytes, Bytes)> {
    let mut data = &payload[..];
    let header = wire::get_len_payload(&mut data)?;
    let header_start = payload.len() - data.len() - header.len();
    let header_bytes = payload.slice(header_start..header_start + header.len());

    let body_len = wire::get_varint(&mut data)? as usize;
    if body_len != data.len() {
        return Err(RpcError::Corruption(format!(
            "body length {body_len} does not match {} remaining payload bytes",
            data.len()
        )));
    }
    let body = payload.slice(payload.len() - body_len..);
    Ok((header_bytes, body))
}

/// Splits a call body into the main message and its sidecars using the
/// offsets recorded in the header.
///
/// Offsets must be monotonically non-decreasing and within the body;
/// anything else is [`RpcError::Corruption`].
pub fn split_sidecars(body: Bytes, offsets: &[u32]) -> Result<(Bytes, Vec<Bytes>)> {
    if offsets.is_empty() {
        return Ok((body, Vec::new()));
    }
    let mut bounds = Vec::with_capacity(offsets.len() + 1);
    for &offset in offsets {
        bounds.push(offset as usize);
    }
    bounds.push(body.len());

    let msg_end = bounds[0];
    for window in bounds.windows(2) {
        if window[0] > window[1] || window[1] > body.len() {
            return Err(RpcError::Corruption(format!(
                "sidecar offset {} out of bounds for body of {} bytes",
                window[0],
                body.len()
            )));
        }
    }

    let msg = body.slice(..msg_end);
    let sidecars = bounds
        .windows(2)
        .map(|w| body.slice(w[0]..w[1]))
        .collect();
    Ok((msg, sidecars))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RemoteMethod;

    fn body(data: &[u8]) -> Bytes {
        Bytes::copy_from_slice(data)
    }

    #[test]
    fn test_request_round_trip() {
        let method = RemoteMethod::new("EchoService", "Echo");
        let frame = serialize_request(7, &method, 1_000, &body(b"request body"));

        let mut buf = BytesMut::from(&frame[..]);
        let payload = extract_frame(&mut buf, 8 << 20).unwrap().unwrap();
        assert!(buf.is_empty());

        let (header, call_body) = parse_request(&payload).unwrap();
        assert_eq!(header.call_id, 7);
        assert_eq!(header.remote_method, method);
        assert_eq!(header.timeout_millis, 1_000);
        assert_eq!(&call_body[..], b"request body");
    }

    #[test]
    fn test_response_round_trip_with_sidecars() {
        let sidecars = vec![body(b"sidecar one"), body(b""), body(b"sidecar three")];
        let frame = serialize_response(42, &body(b"main message"), &sidecars, false);

        let mut buf = BytesMut::from(&frame[..]);
        let payload = extract_frame(&mut buf, 8 << 20).unwrap().unwrap();
        let (header, call_body) = parse_response(&payload).unwrap();
        assert_eq!(header.call_id, 42);
        assert!(!header.is_error);
        assert_eq!(header.sidecar_offsets, vec![12, 23, 23]);

        let (msg, parsed) = split_sidecars(call_body, &header.sidecar_offsets).unwrap();
        assert_eq!(&msg[..], b"main message");
        assert_eq!(parsed, sidecars);
    }

    #[test]
    fn test_extract_partial_frames() {
        let method = RemoteMethod::new("S", "M");
        let first = serialize_request(1, &method, 0, &body(b"one"));
        let second = serialize_request(2, &method, 0, &body(b"two"));

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&first);
        buf.extend_from_slice(&second[..second.len() - 1]);

        assert!(extract_frame(&mut buf, 8 << 20).unwrap().is_some());
        assert!(extract_frame(&mut buf, 8 << 20).unwrap().is_none());
        let held = buf.len();

        buf.extend_from_slice(&second[second.len() - 1..]);
        assert_eq!(held + 1, buf.len());
        let payload = extract_frame(&mut buf, 8 << 20).unwrap().unwrap();
        let (header, _) = parse_request(&payload).unwrap();
        assert_eq!(header.call_id, 2);
    }

    #[test]
    fn test_extract_rejects_oversized_frame() {
        let max = 8 << 20;
        let mut buf = BytesMut::new();
        buf.put_u32((max - MSG_LENGTH_PREFIX_LEN as u32) + 1);
        let err = extract_frame(&mut buf, max as usize).unwrap_err();
        assert!(err.is_network_error());
    }

    #[test]
    fn test_extract_accepts_frame_at_limit() {
        let max = 64usize;
        let mut buf = BytesMut::new();
        buf.put_u32((max - MSG_LENGTH_PREFIX_LEN) as u32);
        buf.put_slice(&vec![0u8; max - MSG_LENGTH_PREFIX_LEN]);
        assert!(extract_frame(&mut buf, max).unwrap().is_some());
    }

    #[test]
    fn test_body_length_mismatch() {
        let method = RemoteMethod::new("S", "M");
        let frame = serialize_request(1, &method, 0, &body(b"payload"));
        let mut buf = BytesMut::from(&frame[..]);
        let payload = extract_frame(&mut buf, 8 << 20).unwrap().unwrap();

        // Truncate the body: header parses, body length no longer matches.
        let truncated = payload.slice(..payload.len() - 2);
        assert!(matches!(
            parse_request(&truncated),
            Err(RpcError::Corruption(_))
        ));
    }

    #[test]
    fn test_split_sidecars_out_of_bounds() {
        let err = split_sidecars(body(b"short"), &[99]).unwrap_err();
        assert!(matches!(err, RpcError::Corruption(_)));

        let err = split_sidecars(body(b"abcdef"), &[4, 2]).unwrap_err();
        assert!(matches!(err, RpcError::Corruption(_)));
    }

    #[test]
    fn test_error_response() {
        use crate::protocol::header::ErrorStatus;
        let status = ErrorStatus::new("boom", 3);
        let frame = serialize_response(5, &status, &[], true);

        let mut buf = BytesMut::from(&frame[..]);
        let payload = extract_frame(&mut buf, 8 << 20).unwrap().unwrap();
        let (header, call_body) = parse_response(&payload).unwrap();
        assert!(header.is_error);
        let decoded = ErrorStatus::decode(&call_body).unwrap();
        assert_eq!(decoded, status);
    }
}

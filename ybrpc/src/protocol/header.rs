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

//! Request and response headers of the YB wire protocol.
//!
//! Each framed payload starts with a varint-prefixed header record:
//! [`RequestHeader`] on calls flowing toward a server, [`ResponseHeader`]
//! on the way back. Both carry the call id that multiplexes concurrent
//! calls over one connection. [`ErrorStatus`] is the body of a response
//! whose header has `is_error` set.
//!
//! Field layout (protobuf-like tags):
//!
//! | record           | field             | tag | type            |
//! |------------------|-------------------|-----|-----------------|
//! | `RequestHeader`  | `call_id`         | 1   | varint          |
//! |                  | `remote_method`   | 2   | nested record   |
//! |                  | `timeout_millis`  | 3   | varint          |
//! | `ResponseHeader` | `call_id`         | 1   | varint          |
//! |                  | `is_error`        | 2   | varint bool     |
//! |                  | `sidecar_offsets` | 3   | repeated varint |
//! | `RemoteMethod`   | `service`         | 1   | bytes           |
//! |                  | `method`          | 2   | bytes           |
//! | `ErrorStatus`    | `message`         | 1   | bytes           |
//! |                  | `code`            | 2   | varint          |

use std::fmt;

use bytes::BytesMut;

use crate::error::{Result, RpcError};
use crate::protocol::frame::RpcMessage;
use crate::protocol::wire;

/// Fully-qualified name of a remotely invocable method.
///
/// # Examples
///
/// ```rust
/// use ybrpc::RemoteMethod;
///
/// let method = RemoteMethod::new("EchoService", "Echo");
/// assert_eq!(method.to_string(), "EchoService.Echo");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RemoteMethod {
    service: String,
    method: String,
}

impl RemoteMethod {
    /// Creates a method reference from a service and method name.
    pub fn new(service: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            method: method.into(),
        }
    }

    /// The service name.
    #[must_use]
    pub fn service(&self) -> &str {
        &self.service
    }

    /// The method name within the service.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }

    fn encoded_len(&self) -> usize {
        wire::len_field_len(1, self.service.len()) + wire::len_field_len(2, self.method.len())
    }

    fn encode(&self, buf: &mut BytesMut) {
        wire::put_len_field(buf, 1, self.service.as_bytes());
        wire::put_len_field(buf, 2, self.method.as_bytes());
    }

    fn decode(mut data: &[u8]) -> Result<Self> {
        let mut service = None;
        let mut method = None;
        while !data.is_empty() {
            let (tag, wire_type) = wire::get_key(&mut data)?;
            match tag {
                1 => service = Some(utf8(wire::get_len_payload(&mut data)?)?),
                2 => method = Some(utf8(wire::get_len_payload(&mut data)?)?),
                _ => wire::skip_field(&mut data, wire_type)?,
            }
        }
        match (service, method) {
            (Some(service), Some(method)) => Ok(Self { service, method }),
            _ => Err(RpcError::Corruption(
                "remote_method in request header is not initialized".to_string(),
            )),
        }
    }
}

impl fmt::Display for RemoteMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.service, self.method)
    }
}

fn utf8(data: &[u8]) -> Result<String> {
    String::from_utf8(data.to_vec())
        .map_err(|_| RpcError::Corruption("non-UTF-8 string field".to_string()))
}

/// Header of an outbound call as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHeader {
    /// Call id, unique within a connection and strictly increasing.
    pub call_id: i32,
    /// The method being invoked. Required; its absence is [`RpcError::Corruption`].
    pub remote_method: RemoteMethod,
    /// Client-side deadline in milliseconds; `0` means no deadline.
    pub timeout_millis: u32,
}

impl RequestHeader {
    pub(crate) fn encoded_len(&self) -> usize {
        wire::varint_field_len(1, self.call_id as u64)
            + wire::len_field_len(2, self.remote_method.encoded_len())
            + wire::varint_field_len(3, u64::from(self.timeout_millis))
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        wire::put_varint_field(buf, 1, self.call_id as u64);
        let mut nested = BytesMut::with_capacity(self.remote_method.encoded_len());
        self.remote_method.encode(&mut nested);
        wire::put_len_field(buf, 2, &nested);
        wire::put_varint_field(buf, 3, u64::from(self.timeout_millis));
    }

    /// Decodes a request header, enforcing the presence of `call_id` and
    /// `remote_method`.
    pub(crate) fn decode(mut data: &[u8]) -> Result<Self> {
        let mut call_id = None;
        let mut remote_method = None;
        let mut timeout_millis = 0;
        while !data.is_empty() {
            let (tag, wire_type) = wire::get_key(&mut data)?;
            match tag {
                1 => call_id = Some(decode_call_id(&mut data)?),
                2 => remote_method = Some(RemoteMethod::decode(wire::get_len_payload(&mut data)?)?),
                3 => timeout_millis = decode_u32(&mut data, "timeout_millis")?,
                _ => wire::skip_field(&mut data, wire_type)?,
            }
        }
        let Some(call_id) = call_id else {
            return Err(RpcError::Corruption(
                "request header missing call id".to_string(),
            ));
        };
        let Some(remote_method) = remote_method else {
            return Err(RpcError::Corruption(
                "request header must specify remote_method".to_string(),
            ));
        };
        Ok(Self {
            call_id,
            remote_method,
            timeout_millis,
        })
    }
}

/// Header of a call response as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResponseHeader {
    /// Call id this response answers.
    pub call_id: i32,
    /// Whether the body is an [`ErrorStatus`] instead of the method response.
    pub is_error: bool,
    /// Offsets of response sidecars, measured from the start of the body.
    pub sidecar_offsets: Vec<u32>,
}

impl ResponseHeader {
    pub(crate) fn encoded_len(&self) -> usize {
        let mut len = wire::varint_field_len(1, self.call_id as u64)
            + wire::varint_field_len(2, u64::from(self.is_error));
        for &offset in &self.sidecar_offsets {
            len += wire::varint_field_len(3, u64::from(offset));
        }
        len
    }

    pub(crate) fn encode(&self, buf: &mut BytesMut) {
        wire::put_varint_field(buf, 1, self.call_id as u64);
        wire::put_varint_field(buf, 2, u64::from(self.is_error));
        for &offset in &self.sidecar_offsets {
            wire::put_varint_field(buf, 3, u64::from(offset));
        }
    }

    /// Decodes a response header, enforcing the presence of `call_id`.
    pub(crate) fn decode(mut data: &[u8]) -> Result<Self> {
        let mut call_id = None;
        let mut is_error = false;
        let mut sidecar_offsets = Vec::new();
        while !data.is_empty() {
            let (tag, wire_type) = wire::get_key(&mut data)?;
            match tag {
                1 => call_id = Some(decode_call_id(&mut data)?),
                2 => is_error = wire::get_varint(&mut data)? != 0,
                3 => sidecar_offsets.push(decode_u32(&mut data, "sidecar offset")?),
                _ => wire::skip_field(&mut data, wire_type)?,
            }
        }
        let Some(call_id) = call_id else {
            return Err(RpcError::Corruption(
                "response header missing call id".to_string(),
            ));
        };
        Ok(Self {
            call_id,
            is_error,
            sidecar_offsets,
        })
    }
}

fn decode_call_id(data: &mut &[u8]) -> Result<i32> {
    let raw = wire::get_varint(data)?;
    i32::try_from(raw).map_err(|_| RpcError::Corruption(format!("call id {raw} out of range")))
}

fn decode_u32(data: &mut &[u8], what: &str) -> Result<u32> {
    let raw = wire::get_varint(data)?;
    u32::try_from(raw).map_err(|_| RpcError::Corruption(format!("{what} {raw} out of range")))
}

/// Body of an `is_error` response.
///
/// Servers send this in place of the method response; clients surface it as
/// [`RpcError::Remote`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ErrorStatus {
    /// Human-readable description of the failure.
    pub message: String,
    /// Application-defined error code.
    pub code: u32,
}

impl ErrorStatus {
    /// Creates an error status with the given message and code.
    pub fn new(message: impl Into<String>, code: u32) -> Self {
        Self {
            message: message.into(),
            code,
        }
    }

    /// Decodes an error status from a response body.
    pub fn decode(mut data: &[u8]) -> Result<Self> {
        let mut status = Self::default();
        while !data.is_empty() {
            let (tag, wire_type) = wire::get_key(&mut data)?;
            match tag {
                1 => status.message = utf8(wire::get_len_payload(&mut data)?)?,
                2 => status.code = decode_u32(&mut data, "error code")?,
                _ => wire::skip_field(&mut data, wire_type)?,
            }
        }
        Ok(status)
    }
}

impl RpcMessage for ErrorStatus {
    fn byte_size(&self) -> usize {
        wire::len_field_len(1, self.message.len()) + wire::varint_field_len(2, u64::from(self.code))
    }

    fn serialize(&self, buf: &mut BytesMut) {
        wire::put_len_field(buf, 1, self.message.as_bytes());
        wire::put_varint_field(buf, 2, u64::from(self.code));
    }
}

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

//! Wire codec for the YB protocol: length-prefixed frames, varint-tagged
//! headers, and sidecar-carrying bodies.
//!
//! The codec is purely computational and never touches a socket. The
//! connection layer feeds received bytes through [`extract_frame`] and
//! [`parse_request`]/[`parse_response`], and emits frames built by
//! [`serialize_request`]/[`serialize_response`].

mod frame;
mod header;
mod wire;

pub use frame::{
    extract_frame, parse_request, parse_response, serialize_request, serialize_response,
    split_sidecars, RpcMessage, MSG_LENGTH_PREFIX_LEN,
};
pub use header::{ErrorStatus, RemoteMethod, RequestHeader, ResponseHeader};

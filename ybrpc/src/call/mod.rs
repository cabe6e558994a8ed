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

//! Call objects flowing through the reactor: outbound calls issued by
//! clients and inbound calls parsed off server connections.

mod inbound;
mod outbound;

pub use inbound::{InboundCall, InboundCallHandler, UnroutableHandler};
pub use outbound::{CallResponse, OutboundCall, OutboundCallState, ResponseCallback};

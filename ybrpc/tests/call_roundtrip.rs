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

//! End-to-end call round-trips between two messengers over loopback TCP.

use std::sync::mpsc;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use ybrpc::{
    CallResponse, ConnectionId, DumpRunningRpcsRequest, ErrorStatus, InboundCall,
    InboundCallHandler, Messenger, OutboundCall, RemoteMethod, RpcError, UserCredentials,
};

fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .try_init();
}

/// Issues a call and blocks until its callback fires.
fn call_sync(
    messenger: &Messenger,
    conn_id: &ConnectionId,
    method: RemoteMethod,
    body: &[u8],
) -> ybrpc::Result<CallResponse> {
    let (tx, rx) = mpsc::channel();
    let call = OutboundCall::new(
        conn_id.clone(),
        method,
        Bytes::copy_from_slice(body),
        Some(Duration::from_secs(10)),
        Box::new(move |result| {
            tx.send(result).expect("test receiver dropped");
        }),
    );
    messenger.queue_outbound_call(call);
    rx.recv_timeout(Duration::from_secs(10))
        .expect("callback never fired")
}

/// Echo service used by these tests. Runs inline on the reactor thread,
/// except for `Slow`, which responds from a helper thread.
struct EchoHandler;

impl InboundCallHandler for EchoHandler {
    fn queue_inbound(&self, call: Arc<InboundCall>) {
        let body = call.serialized_request().clone();
        let method = call.remote_method().method().to_string();
        match method.as_str() {
            "Echo" => call.respond_success(&body),
            "EchoWithSidecars" => {
                call.add_sidecar(Bytes::from_static(b"first sidecar"));
                call.add_sidecar(Bytes::new());
                call.add_sidecar(Bytes::from_static(b"third sidecar"));
                call.respond_success(&body);
            }
            "Fail" => call.respond_failure(&ErrorStatus::new("the request failed", 42)),
            "Slow" => {
                std::thread::spawn(move || {
                    std::thread::sleep(Duration::from_millis(300));
                    let body = call.serialized_request().clone();
                    call.respond_success(&body);
                });
            }
            other => {
                call.respond_failure(&ErrorStatus::new(format!("no method {other}"), 1));
            }
        }
    }
}

fn start_pair() -> (Messenger, Messenger, ConnectionId) {
    init_logging();
    let server = Messenger::builder("echo-server")
        .reactor_count(2)
        .inbound_handler(Arc::new(EchoHandler))
        .build();
    let addr = server
        .listen("127.0.0.1:0".parse().unwrap())
        .expect("listen failed");
    let client = Messenger::builder("echo-client").reactor_count(1).build();
    let conn_id = ConnectionId::new(addr, UserCredentials::default());
    (server, client, conn_id)
}

#[test]
fn test_echo_round_trip() {
    let (server, client, conn_id) = start_pair();

    let response = call_sync(
        &client,
        &conn_id,
        RemoteMethod::new("EchoService", "Echo"),
        b"hello over the wire",
    )
    .expect("echo call failed");
    assert_eq!(&response.body[..], b"hello over the wire");
    assert!(response.sidecars.is_empty());

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_response_sidecars() {
    let (server, client, conn_id) = start_pair();

    let response = call_sync(
        &client,
        &conn_id,
        RemoteMethod::new("EchoService", "EchoWithSidecars"),
        b"payload",
    )
    .expect("call failed");
    assert_eq!(&response.body[..], b"payload");
    assert_eq!(response.sidecars.len(), 3);
    assert_eq!(&response.sidecars[0][..], b"first sidecar");
    assert!(response.sidecars[1].is_empty());
    assert_eq!(&response.sidecars[2][..], b"third sidecar");

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_remote_error_response() {
    let (server, client, conn_id) = start_pair();

    let err = call_sync(
        &client,
        &conn_id,
        RemoteMethod::new("EchoService", "Fail"),
        b"boom",
    )
    .expect_err("call should fail");
    match err {
        RpcError::Remote { code, message } => {
            assert_eq!(code, 42);
            assert_eq!(message, "the request failed");
        }
        other => panic!("expected remote error, got {other:?}"),
    }

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_concurrent_calls_share_one_connection() {
    let (server, client, conn_id) = start_pair();

    let (tx, rx) = mpsc::channel();
    for i in 0..8u32 {
        let tx = tx.clone();
        let call = OutboundCall::new(
            conn_id.clone(),
            RemoteMethod::new("EchoService", "Echo"),
            Bytes::from(i.to_be_bytes().to_vec()),
            Some(Duration::from_secs(10)),
            Box::new(move |result| {
                tx.send(result).expect("test receiver dropped");
            }),
        );
        client.queue_outbound_call(call);
    }
    for _ in 0..8 {
        let response = rx
            .recv_timeout(Duration::from_secs(10))
            .expect("callback never fired")
            .expect("call failed");
        assert_eq!(response.body.len(), 4);
    }

    // Every call rode the same client connection.
    let metrics = client.metrics();
    assert_eq!(metrics.num_client_connections, 1);
    let server_metrics = server.metrics();
    assert_eq!(server_metrics.num_server_connections, 1);

    client.shutdown();
    server.shutdown();
}

#[test]
fn test_dump_running_rpcs_sees_call_in_flight() {
    let (server, client, conn_id) = start_pair();

    let (tx, rx) = mpsc::channel();
    let call = OutboundCall::new(
        conn_id.clone(),
        RemoteMethod::new("EchoService", "Slow"),
        Bytes::from_static(b"take your time"),
        Some(Duration::from_secs(10)),
        Box::new(move |result| {
            tx.send(result).expect("test receiver dropped");
        }),
    );
    client.queue_outbound_call(call);
    std::thread::sleep(Duration::from_millis(100));

    let dump = client
        .dump_running_rpcs(DumpRunningRpcsRequest {
            include_traces: false,
        })
        .expect("dump failed");
    let calls: Vec<_> = dump
        .connections
        .iter()
        .flat_map(|conn| conn.calls_in_flight.iter())
        .collect();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].method, "EchoService.Slow");
    assert!(calls[0].micros_elapsed > 0);

    // Dumps serialize for the introspection endpoint.
    let rendered = serde_json::to_string(&dump).expect("dump must serialize");
    assert!(rendered.contains("EchoService.Slow"));

    let response = rx
        .recv_timeout(Duration::from_secs(10))
        .expect("callback never fired")
        .expect("slow call failed");
    assert_eq!(&response.body[..], b"take your time");

    client.shutdown();
    server.shutdown();
}

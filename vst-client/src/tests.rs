//! End-to-end tests against an in-process VelocyStream server

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;
use serde_json::{Value, json};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;
use vst_core::VST_PREAMBLE;
use vst_network::{Chunk, ChunkBuffer, MessageAssembler, encode_chunks, encode_message, parse_chunk};

use crate::{
    ClientConfig, ClientError, Credentials, Host, HostHandle, JsonSerializer,
    LoadBalancingStrategy, Lookup, Request, RequestType, Response, Serializer, ServerError,
    TransportError, VstClient,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// =============================================================================
// Mock server
// =============================================================================

enum Reply {
    /// Response head with the given code followed by a JSON body
    Json(u16, Value),
    /// Response head without a body
    Empty(u16),
    /// Arbitrary message payload
    Payload(Vec<u8>),
    /// Bytes written to the socket as-is, outside any chunk
    Raw(Vec<u8>),
    Delayed(Duration, Box<Reply>),
    /// Never answer
    Ignore,
    /// Close the connection
    Hangup,
}

type Handler = Arc<dyn Fn(&Value, &[u8]) -> Reply + Send + Sync>;

struct MockServer {
    host: Host,
    connections: Arc<AtomicUsize>,
    /// Non-authentication messages received
    requests: Arc<AtomicUsize>,
}

impl MockServer {
    async fn start(handler: impl Fn(&Value, &[u8]) -> Reply + Send + Sync + 'static) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(AtomicUsize::new(0));
        let handler: Handler = Arc::new(handler);

        let accepted = connections.clone();
        let received = requests.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                accepted.fetch_add(1, Ordering::SeqCst);
                tokio::spawn(serve(socket, handler.clone(), received.clone()));
            }
        });

        Self {
            host: Host::new("127.0.0.1", port),
            connections,
            requests,
        }
    }

    /// Answers every request with 200 and `{"server": name, "path": <path>}`.
    async fn named(name: &'static str) -> Self {
        Self::start(move |head, _| {
            if is_auth(head) {
                return Reply::Empty(200);
            }
            Reply::Json(200, json!({ "server": name, "path": head[4] }))
        })
        .await
    }

    fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }
}

fn is_auth(head: &Value) -> bool {
    head[1] == json!(1000)
}

async fn serve(socket: tokio::net::TcpStream, handler: Handler, requests: Arc<AtomicUsize>) {
    let (mut reader, writer) = socket.into_split();
    let writer = Arc::new(Mutex::new(writer));

    let mut preamble = [0u8; 11];
    if reader.read_exact(&mut preamble).await.is_err() || preamble[..] != *VST_PREAMBLE {
        return;
    }

    let mut buffer = ChunkBuffer::new();
    let mut assembler = MessageAssembler::new();
    loop {
        match reader.read_buf(buffer.read_buf(4096)).await {
            Ok(0) | Err(_) => return,
            Ok(_) => {},
        }
        while let Some((chunk, used)) = parse_chunk(buffer.as_slice()).unwrap() {
            buffer.consume(used);
            let Some(message) = assembler.feed(chunk).unwrap() else {
                continue;
            };

            let mut values = serde_json::Deserializer::from_slice(&message.payload).into_iter::<Value>();
            let head = values.next().unwrap().unwrap();
            let body = message.payload.slice(values.byte_offset()..);
            if !is_auth(&head) {
                requests.fetch_add(1, Ordering::SeqCst);
            }

            match handler(&head, &body) {
                Reply::Hangup => return,
                reply => {
                    tokio::spawn(respond(writer.clone(), message.id, reply));
                },
            }
        }
        buffer.compact();
    }
}

async fn respond(writer: Arc<Mutex<OwnedWriteHalf>>, message_id: u64, mut reply: Reply) {
    while let Reply::Delayed(delay, inner) = reply {
        tokio::time::sleep(delay).await;
        reply = *inner;
    }

    let payload = match reply {
        Reply::Json(code, body) => {
            let mut payload = json!([1, 2, code, {}]).to_string().into_bytes();
            payload.extend(serde_json::to_vec(&body).unwrap());
            payload
        },
        Reply::Empty(code) => json!([1, 2, code, {}]).to_string().into_bytes(),
        Reply::Payload(payload) => payload,
        Reply::Raw(bytes) => {
            let _ = writer.lock().await.write_all(&bytes).await;
            return;
        },
        Reply::Ignore | Reply::Hangup | Reply::Delayed(..) => return,
    };

    // Small chunks so responses of concurrent requests interleave.
    let chunks = encode_message(message_id, &Bytes::from(payload), 16).unwrap();
    let _ = writer.lock().await.write_all(&encode_chunks(&chunks)).await;
}

async fn dead_host() -> Host {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    Host::new("127.0.0.1", port)
}

fn get(path: &str) -> Request {
    Request::new("_system", RequestType::Get, path)
}

fn json_body(response: &Response) -> Value {
    serde_json::from_slice(response.body.as_deref().unwrap()).unwrap()
}

fn client(hosts: Vec<Host>) -> ClientConfig {
    ClientConfig::new(hosts).with_timeout(Duration::from_secs(5))
}

// =============================================================================
// Requests and responses
// =============================================================================

#[tokio::test]
async fn test_execute_round_trip() {
    init_tracing();
    let server = MockServer::start(|head, body| {
        Reply::Json(
            200,
            json!({
                "database": head[2],
                "type": head[3],
                "path": head[4],
                "params": head[5],
                "meta": head[6],
                "body": String::from_utf8_lossy(body),
            }),
        )
    })
    .await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let request = Request::new("shop", RequestType::Post, "/_api/document/orders")
        .with_query_param("waitForSync", "true")
        .with_header("x-trace", "abc")
        .with_body(&b"{\"qty\":3}"[..]);
    let response = client.execute(&request).await.unwrap();

    assert_eq!(response.response_code, 200);
    assert_eq!(
        json_body(&response),
        json!({
            "database": "shop",
            "type": 2,
            "path": "/_api/document/orders",
            "params": {"waitForSync": "true"},
            "meta": {"x-trace": "abc"},
            "body": "{\"qty\":3}",
        })
    );
    assert_eq!(server.connections(), 1);
}

#[tokio::test]
async fn test_large_request_with_small_chunks() {
    let server = MockServer::start(|_, body| Reply::Json(200, json!({ "len": body.len() }))).await;
    let client = VstClient::new(client(vec![server.host.clone()]).with_chunk_size(7)).unwrap();

    let body = vec![b'x'; 10_000];
    let response = client
        .execute(&get("/_api/blob").with_body(body))
        .await
        .unwrap();
    assert_eq!(json_body(&response), json!({ "len": 10_000 }));
}

#[tokio::test]
async fn test_concurrent_requests_multiplex_one_connection() {
    let server = MockServer::start(|head, _| {
        let path = head[4].as_str().unwrap().to_string();
        // The first request is answered last.
        let delay = if path == "/0" { 200 } else { 10 };
        Reply::Delayed(
            Duration::from_millis(delay),
            Box::new(Reply::Json(200, json!({ "path": path }))),
        )
    })
    .await;
    let client = VstClient::new(client(vec![server.host.clone()]).with_max_connections(1)).unwrap();

    // Open the connection before fanning out.
    client.execute(&get("/warmup")).await.unwrap();

    let mut tasks = Vec::new();
    for i in 0..10 {
        let client = client.clone();
        tasks.push(tokio::spawn(async move {
            let path = format!("/{}", i);
            let response = client.execute(&get(&path)).await.unwrap();
            (path, json_body(&response))
        }));
    }
    for task in tasks {
        let (path, body) = task.await.unwrap();
        assert_eq!(body, json!({ "path": path }));
    }

    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests(), 11);
    assert_eq!(client.pool_stats().connections_created, 1);
}

#[tokio::test]
async fn test_connection_expires_after_ttl() {
    let server = MockServer::named("a").await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_connection_ttl(Duration::from_millis(50)),
    )
    .unwrap();

    client.execute(&get("/one")).await.unwrap();
    tokio::time::sleep(Duration::from_millis(150)).await;
    client.execute(&get("/two")).await.unwrap();

    assert_eq!(server.connections(), 2);
    assert_eq!(client.pool_stats().expired_evictions, 1);
}

// =============================================================================
// Error responses
// =============================================================================

#[tokio::test]
async fn test_not_found_error_is_decoded() {
    let server = MockServer::start(|_, _| {
        Reply::Json(
            404,
            json!({
                "error": true,
                "code": 404,
                "errorNum": 1203,
                "errorMessage": "collection or view not found: orders",
            }),
        )
    })
    .await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let err = client.execute(&get("/_api/collection/orders")).await.unwrap_err();
    match &err {
        ClientError::Server(ServerError {
            response_code,
            error_num,
            error_message,
        }) => {
            assert_eq!(*response_code, 404);
            assert_eq!(*error_num, 1203);
            assert_eq!(error_message, "collection or view not found: orders");
        },
        other => panic!("expected server error, got {:?}", other),
    }
    assert_eq!(err.response_code(), Some(404));
    // Server errors say nothing about host health.
    assert!(client.failed_hosts().is_empty());
}

#[tokio::test]
async fn test_error_without_body_reports_status() {
    let server = MockServer::start(|_, _| Reply::Empty(503)).await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(err, ClientError::Status(503)));
    assert_eq!(err.to_string(), "Response Code: 503");
}

#[tokio::test]
async fn test_lookup_distinguishes_not_found() {
    let server = MockServer::start(|head, _| match head[4].as_str() {
        Some("/missing") => Reply::Json(404, json!({ "error": true, "code": 404, "errorNum": 1202 })),
        Some("/broken") => Reply::Json(500, json!({ "error": true, "code": 500, "errorNum": 4 })),
        _ => Reply::Json(200, json!({ "found": true })),
    })
    .await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let found = client.lookup(&get("/present")).await.unwrap();
    assert!(found.is_found());
    assert_eq!(json_body(&found.into_response().unwrap()), json!({ "found": true }));

    assert!(matches!(client.lookup(&get("/missing")).await.unwrap(), Lookup::NotFound));

    let err = client.lookup(&get("/broken")).await.unwrap_err();
    assert_eq!(err.response_code(), Some(500));
}

// =============================================================================
// Authentication
// =============================================================================

fn auth_server_handler(head: &Value, _: &[u8]) -> Reply {
    if !is_auth(head) {
        return Reply::Json(200, json!({ "ok": true }));
    }
    let accepted = *head == json!([1, 1000, "plain", "root", "secret"])
        || *head == json!([1, 1000, "jwt", "token-123"]);
    if accepted {
        Reply::Empty(200)
    } else {
        Reply::Json(
            401,
            json!({ "error": true, "code": 401, "errorNum": 11, "errorMessage": "not authorized" }),
        )
    }
}

#[tokio::test]
async fn test_basic_authentication() {
    let server = MockServer::start(auth_server_handler).await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_credentials(Credentials::basic("root", "secret")),
    )
    .unwrap();

    client.execute(&get("/_api/version")).await.unwrap();
    client.execute(&get("/_api/version")).await.unwrap();
    // Authenticated once per connection.
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests(), 2);
}

#[tokio::test]
async fn test_jwt_authentication() {
    let server = MockServer::start(auth_server_handler).await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_credentials(Credentials::jwt("token-123")),
    )
    .unwrap();

    client.execute(&get("/_api/version")).await.unwrap();
}

#[tokio::test]
async fn test_authentication_failure_sends_no_request() {
    let server = MockServer::start(auth_server_handler).await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_credentials(Credentials::basic("root", "wrong")),
    )
    .unwrap();

    let err = client.execute(&get("/_api/version")).await.unwrap_err();
    match err {
        ClientError::Authentication(reason) => assert!(reason.contains("not authorized")),
        other => panic!("expected authentication error, got {:?}", other),
    }
    assert_eq!(server.requests(), 0);
    assert_eq!(client.pool_stats().active_connections, 0);
}

// =============================================================================
// Transport failures
// =============================================================================

#[tokio::test]
async fn test_fallback_when_first_host_unreachable() {
    init_tracing();
    let dead = dead_host().await;
    let server = MockServer::named("live").await;
    let client = VstClient::new(client(vec![dead.clone(), server.host.clone()])).unwrap();

    let response = client.execute(&get("/first")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "live");
    assert_eq!(client.failed_hosts(), vec![dead]);

    // The next request goes straight to the healthy host.
    client.execute(&get("/second")).await.unwrap();
    assert_eq!(server.connections(), 1);
    assert_eq!(server.requests(), 2);

    client.reset_failed_hosts();
    assert!(client.failed_hosts().is_empty());
}

#[tokio::test]
async fn test_no_host_available() {
    let first = dead_host().await;
    let second = dead_host().await;
    let client = VstClient::new(client(vec![first.clone(), second.clone()])).unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    match err {
        ClientError::Transport(TransportError::NoHostAvailable(Some(last))) => {
            assert!(matches!(*last, TransportError::ConnectFailed { .. }));
        },
        other => panic!("expected NoHostAvailable, got {:?}", other),
    }
    assert_eq!(client.failed_hosts().len(), 2);
}

#[tokio::test]
async fn test_timeout_marks_host_failed() {
    let server = MockServer::start(|_, _| Reply::Ignore).await;
    let client = VstClient::new(
        ClientConfig::new(vec![server.host.clone()]).with_timeout(Duration::from_millis(100)),
    )
    .unwrap();

    let err = client.execute(&get("/slow")).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::Timeout)));
    assert_eq!(client.failed_hosts(), vec![server.host.clone()]);
    assert_eq!(server.requests(), 1);
}

#[tokio::test]
async fn test_connection_lost_is_not_retried() {
    let server = MockServer::start(|_, _| Reply::Hangup).await;
    let backup = MockServer::named("backup").await;
    let client = VstClient::new(client(vec![server.host.clone(), backup.host.clone()])).unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Transport(TransportError::ConnectionLost(_))
    ));
    assert_eq!(backup.requests(), 0);
    assert_eq!(client.failed_hosts(), vec![server.host.clone()]);

    // Only the next request fails over.
    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "backup");
}

#[tokio::test]
async fn test_protocol_violation_fails_request() {
    let server = MockServer::start(|_, _| {
        // Follow-up chunk for a message that was never started.
        Reply::Raw(Chunk::follow(99, 1, Bytes::from_static(b"stray")).encode())
    })
    .await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(err, ClientError::Protocol(_)), "got {:?}", err);
}

#[tokio::test]
async fn test_undecodable_response_marks_host() {
    let server = MockServer::start(|_, _| Reply::Payload(b"not a response".to_vec())).await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::Decode(_))));
    assert_eq!(client.failed_hosts(), vec![server.host.clone()]);
}

#[tokio::test]
async fn test_closed_client_rejects_requests() {
    let server = MockServer::named("a").await;
    let client = VstClient::new(client(vec![server.host.clone()])).unwrap();
    client.execute(&get("/")).await.unwrap();

    client.close();
    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(err, ClientError::Transport(TransportError::PoolClosed)));
}

struct FailingSerializer;

impl Serializer for FailingSerializer {
    fn encode_request(&self, _: &Request) -> crate::Result<Bytes> {
        Err(ClientError::Serialization("unsupported body".into()))
    }

    fn encode_authentication(&self, credentials: &Credentials) -> crate::Result<Bytes> {
        JsonSerializer.encode_authentication(credentials)
    }

    fn decode_response(&self, payload: Bytes) -> crate::Result<Response> {
        JsonSerializer.decode_response(payload)
    }

    fn decode_error(&self, response_code: u16, body: &[u8]) -> crate::Result<ServerError> {
        JsonSerializer.decode_error(response_code, body)
    }

    fn decode_endpoints(&self, body: &[u8]) -> crate::Result<Vec<String>> {
        JsonSerializer.decode_endpoints(body)
    }
}

#[tokio::test]
async fn test_serialization_error_sends_nothing() {
    let server = MockServer::named("a").await;
    let client = VstClient::with_serializer(
        client(vec![server.host.clone()]),
        Arc::new(FailingSerializer),
    )
    .unwrap();

    let err = client.execute(&get("/")).await.unwrap_err();
    assert!(matches!(err, ClientError::Serialization(_)));
    assert_eq!(server.connections(), 0);
    assert!(client.failed_hosts().is_empty());
}

#[tokio::test]
async fn test_invalid_config_rejected() {
    let err = VstClient::new(ClientConfig::new(Vec::new())).unwrap_err();
    assert!(matches!(err, ClientError::Config(_)));
}

// =============================================================================
// Load balancing and host handles
// =============================================================================

#[tokio::test]
async fn test_round_robin_across_servers() {
    let a = MockServer::named("a").await;
    let b = MockServer::named("b").await;
    let c = MockServer::named("c").await;
    let client = VstClient::new(
        client(vec![a.host.clone(), b.host.clone(), c.host.clone()])
            .with_load_balancing(LoadBalancingStrategy::RoundRobin),
    )
    .unwrap();

    let mut order = Vec::new();
    for _ in 0..7 {
        let response = client.execute(&get("/")).await.unwrap();
        order.push(json_body(&response)["server"].as_str().unwrap().to_string());
    }
    assert_eq!(order, ["a", "b", "c", "a", "b", "c", "a"]);
}

#[tokio::test]
async fn test_host_handle_pins_follow_up_requests() {
    let a = MockServer::named("a").await;
    let b = MockServer::named("b").await;
    let client = VstClient::new(
        client(vec![a.host.clone(), b.host.clone()])
            .with_load_balancing(LoadBalancingStrategy::RoundRobin),
    )
    .unwrap();

    let handle = HostHandle::new();
    for _ in 0..4 {
        let response = client.execute_on(&get("/cursor"), &handle).await.unwrap();
        assert_eq!(json_body(&response)["server"], "a");
    }
    assert_eq!(handle.get(), Some(a.host.clone()));
    assert_eq!(b.requests(), 0);

    // Without the handle the rotation continues.
    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "b");
}

#[tokio::test]
async fn test_independent_clients_share_nothing() {
    let dead = dead_host().await;
    let server = MockServer::named("a").await;
    let first = VstClient::new(client(vec![dead.clone(), server.host.clone()])).unwrap();
    let second = VstClient::new(client(vec![server.host.clone()])).unwrap();

    first.execute(&get("/")).await.unwrap();
    second.execute(&get("/")).await.unwrap();

    assert_eq!(first.failed_hosts(), vec![dead]);
    assert!(second.failed_hosts().is_empty());
    assert_eq!(server.connections(), 2);
}

// =============================================================================
// Host list refresh
// =============================================================================

async fn coordinator(endpoints: Vec<String>) -> MockServer {
    MockServer::start(move |head, _| {
        if head[4] == json!("/_api/cluster/endpoints") {
            let list: Vec<Value> = endpoints
                .iter()
                .map(|e| json!({ "endpoint": e }))
                .collect();
            Reply::Json(200, json!({ "error": false, "code": 200, "endpoints": list }))
        } else {
            Reply::Json(200, json!({ "server": "coordinator" }))
        }
    })
    .await
}

#[tokio::test]
async fn test_refresh_hosts_replaces_list() {
    let target = MockServer::named("target").await;
    let endpoint = format!("tcp://127.0.0.1:{}", target.host.port());
    let coord = coordinator(vec![endpoint, "udp://nowhere:1".into()]).await;

    let client = VstClient::new(
        client(vec![coord.host.clone()]).with_acquire_host_list(true),
    )
    .unwrap();

    let hosts = client.refresh_hosts().await.unwrap();
    assert_eq!(hosts, vec![target.host.clone()]);
    assert_eq!(client.hosts(), vec![target.host.clone()]);

    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "target");
    // The endpoint call used its own connection, which was closed.
    assert_eq!(client.pool_stats().connections_closed, 1);
}

#[tokio::test]
async fn test_first_request_refreshes_host_list() {
    let target = MockServer::named("target").await;
    let endpoint = format!("tcp://127.0.0.1:{}", target.host.port());
    let coord = coordinator(vec![endpoint]).await;

    let client = VstClient::new(
        client(vec![coord.host.clone()]).with_acquire_host_list(true),
    )
    .unwrap();

    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "target");
    assert_eq!(coord.requests(), 1);
    assert_eq!(target.requests(), 1);
}

#[tokio::test]
async fn test_forbidden_refresh_keeps_previous_hosts() {
    let server = MockServer::start(|head, _| {
        if head[4] == json!("/_api/cluster/endpoints") {
            Reply::Json(
                403,
                json!({ "error": true, "code": 403, "errorNum": 11, "errorMessage": "forbidden" }),
            )
        } else {
            Reply::Json(200, json!({ "server": "single" }))
        }
    })
    .await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_acquire_host_list(true),
    )
    .unwrap();

    let err = client.refresh_hosts().await.unwrap_err();
    assert_eq!(err.response_code(), Some(403));
    assert_eq!(client.hosts(), vec![server.host.clone()]);

    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "single");
    assert!(client.failed_hosts().is_empty());
}

#[tokio::test]
async fn test_implicit_refresh_failure_is_swallowed() {
    let server = MockServer::start(|head, _| {
        if head[4] == json!("/_api/cluster/endpoints") {
            Reply::Empty(403)
        } else {
            Reply::Json(200, json!({ "server": "single" }))
        }
    })
    .await;
    let client = VstClient::new(
        client(vec![server.host.clone()]).with_acquire_host_list(true),
    )
    .unwrap();

    let response = client.execute(&get("/")).await.unwrap();
    assert_eq!(json_body(&response)["server"], "single");
    // One failed refresh, then the request itself; the refresh is not
    // attempted again until the interval elapses.
    client.execute(&get("/")).await.unwrap();
    assert_eq!(server.requests(), 3);
}

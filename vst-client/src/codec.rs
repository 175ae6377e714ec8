//! Payload serialization hook
//!
//! The transport only moves opaque message payloads. A [`Serializer`] decides
//! what goes inside them: the request/response head, the authentication
//! message, and the error and endpoint-list bodies the transport itself has
//! to understand.
//!
//! [`JsonSerializer`] is the bundled implementation. A payload is the head as
//! a JSON array immediately followed by the raw body bytes:
//!
//! ```text
//! request   [1, 1, "<db>", <type>, "<path>", {params}, {meta}]<body>
//! auth      [1, 1000, "plain", "<user>", "<password>"]
//!           [1, 1000, "jwt", "<token>"]
//! response  [1, 2, <code>, {meta}]<body>
//! ```

use std::collections::BTreeMap;

use bytes::{BufMut, Bytes, BytesMut};
use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::error::{ClientError, Result, TransportError};
use crate::request::{Credentials, Request, Response, ServerError};

const VST_VERSION: u32 = 1;
const MESSAGE_TYPE_REQUEST: u32 = 1;
const MESSAGE_TYPE_RESPONSE: u32 = 2;
const MESSAGE_TYPE_AUTHENTICATION: u32 = 1000;

pub trait Serializer: Send + Sync {
    /// Head followed by body for one request.
    fn encode_request(&self, request: &Request) -> Result<Bytes>;

    fn encode_authentication(&self, credentials: &Credentials) -> Result<Bytes>;

    fn decode_response(&self, payload: Bytes) -> Result<Response>;

    /// Decode the error body of a response with code >= 300.
    fn decode_error(&self, response_code: u16, body: &[u8]) -> Result<ServerError>;

    /// Decode the endpoint list returned by the cluster endpoints call.
    fn decode_endpoints(&self, body: &[u8]) -> Result<Vec<String>>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct JsonSerializer;

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorEntity {
    code: Option<u16>,
    #[serde(default)]
    error_num: u32,
    #[serde(default)]
    error_message: String,
}

#[derive(Deserialize)]
struct EndpointsEntity {
    endpoints: Vec<EndpointEntry>,
}

#[derive(Deserialize)]
struct EndpointEntry {
    endpoint: String,
}

fn decode_err(msg: impl Into<String>) -> ClientError {
    ClientError::Transport(TransportError::Decode(msg.into()))
}

fn string_map(map: &BTreeMap<String, String>) -> Value {
    Value::Object(
        map.iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect::<Map<String, Value>>(),
    )
}

fn head_u32(head: &[Value], index: usize, field: &str) -> Result<u32> {
    head.get(index)
        .and_then(Value::as_u64)
        .and_then(|v| u32::try_from(v).ok())
        .ok_or_else(|| decode_err(format!("response head has no valid {}", field)))
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self
    }

    fn encode_head(head: &Value, body: Option<&Bytes>) -> Result<Bytes> {
        let head = serde_json::to_vec(head)
            .map_err(|e| ClientError::Serialization(format!("failed to encode head: {}", e)))?;
        let body_len = body.map_or(0, Bytes::len);
        let mut buf = BytesMut::with_capacity(head.len() + body_len);
        buf.put_slice(&head);
        if let Some(body) = body {
            buf.put_slice(body);
        }
        Ok(buf.freeze())
    }
}

impl Serializer for JsonSerializer {
    fn encode_request(&self, request: &Request) -> Result<Bytes> {
        let head = json!([
            VST_VERSION,
            MESSAGE_TYPE_REQUEST,
            request.database,
            request.request_type.code(),
            request.path,
            string_map(&request.query_params),
            string_map(&request.headers),
        ]);
        Self::encode_head(&head, request.body.as_ref())
    }

    fn encode_authentication(&self, credentials: &Credentials) -> Result<Bytes> {
        let head = match credentials {
            Credentials::Basic { user, password } => {
                json!([VST_VERSION, MESSAGE_TYPE_AUTHENTICATION, "plain", user, password])
            },
            Credentials::Jwt { token } => {
                json!([VST_VERSION, MESSAGE_TYPE_AUTHENTICATION, "jwt", token])
            },
        };
        Self::encode_head(&head, None)
    }

    fn decode_response(&self, payload: Bytes) -> Result<Response> {
        let mut values = serde_json::Deserializer::from_slice(&payload).into_iter::<Value>();
        let head = values
            .next()
            .ok_or_else(|| decode_err("empty response payload"))?
            .map_err(|e| decode_err(format!("invalid response head: {}", e)))?;
        let body_offset = values.byte_offset();

        let Value::Array(head) = head else {
            return Err(decode_err("response head is not an array"));
        };

        let version = head_u32(&head, 0, "version")?;
        let message_type = head_u32(&head, 1, "message type")?;
        if message_type != MESSAGE_TYPE_RESPONSE {
            return Err(decode_err(format!(
                "expected response message type {}, got {}",
                MESSAGE_TYPE_RESPONSE, message_type
            )));
        }
        let response_code = u16::try_from(head_u32(&head, 2, "response code")?)
            .map_err(|_| decode_err("response code out of range"))?;

        let meta = match head.get(3) {
            Some(Value::Object(map)) => map
                .iter()
                .map(|(k, v)| {
                    let value = match v {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    (k.clone(), value)
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        let body = (body_offset < payload.len()).then(|| payload.slice(body_offset..));

        Ok(Response {
            version,
            message_type,
            response_code,
            meta,
            body,
        })
    }

    fn decode_error(&self, response_code: u16, body: &[u8]) -> Result<ServerError> {
        let entity: ErrorEntity = serde_json::from_slice(body)
            .map_err(|e| decode_err(format!("invalid error body: {}", e)))?;
        Ok(ServerError {
            response_code: entity.code.unwrap_or(response_code),
            error_num: entity.error_num,
            error_message: entity.error_message,
        })
    }

    fn decode_endpoints(&self, body: &[u8]) -> Result<Vec<String>> {
        let entity: EndpointsEntity = serde_json::from_slice(body)
            .map_err(|e| decode_err(format!("invalid endpoint list: {}", e)))?;
        Ok(entity.endpoints.into_iter().map(|e| e.endpoint).collect())
    }
}

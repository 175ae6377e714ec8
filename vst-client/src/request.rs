//! Requests and responses carried over VelocyStream
//!
//! Both are opaque to the transport: the [`Serializer`](crate::Serializer)
//! turns a [`Request`] into a message payload and a payload back into a
//! [`Response`].

use std::collections::BTreeMap;
use std::fmt;

use bytes::Bytes;

/// Request verb with its VelocyStream wire code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RequestType {
    Delete,
    Get,
    Post,
    Put,
    Head,
    Patch,
    Options,
}

impl RequestType {
    pub fn code(self) -> u8 {
        match self {
            Self::Delete => 0,
            Self::Get => 1,
            Self::Post => 2,
            Self::Put => 3,
            Self::Head => 4,
            Self::Patch => 5,
            Self::Options => 6,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Self::Delete),
            1 => Some(Self::Get),
            2 => Some(Self::Post),
            3 => Some(Self::Put),
            4 => Some(Self::Head),
            5 => Some(Self::Patch),
            6 => Some(Self::Options),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub database: String,
    pub request_type: RequestType,
    pub path: String,
    pub query_params: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl Request {
    pub fn new(
        database: impl Into<String>,
        request_type: RequestType,
        path: impl Into<String>,
    ) -> Self {
        Self {
            database: database.into(),
            request_type,
            path: path.into(),
            query_params: BTreeMap::new(),
            headers: BTreeMap::new(),
            body: None,
        }
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = Some(body.into());
        self
    }

    pub fn with_query_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query_params.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub version: u32,
    pub message_type: u32,
    pub response_code: u16,
    pub meta: BTreeMap<String, String>,
    pub body: Option<Bytes>,
}

impl Response {
    #[inline]
    pub fn is_success(&self) -> bool {
        self.response_code < 300
    }
}

/// Credentials presented in the authentication handshake.
#[derive(Clone, PartialEq, Eq)]
pub enum Credentials {
    Basic { user: String, password: String },
    Jwt { token: String },
}

impl Credentials {
    pub fn basic(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self::Basic {
            user: user.into(),
            password: password.into(),
        }
    }

    pub fn jwt(token: impl Into<String>) -> Self {
        Self::Jwt {
            token: token.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Basic { user, .. } => f
                .debug_struct("Basic")
                .field("user", user)
                .field("password", &"***")
                .finish(),
            Self::Jwt { .. } => f.debug_struct("Jwt").field("token", &"***").finish(),
        }
    }
}

/// Structured error body returned with a response code >= 300.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerError {
    pub response_code: u16,
    pub error_num: u32,
    pub error_message: String,
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Response: {}, Error: {} - {}",
            self.response_code, self.error_num, self.error_message
        )
    }
}

impl std::error::Error for ServerError {}

/// Outcome of a lookup: the error case is carried by the surrounding `Result`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Response),
    NotFound,
}

impl Lookup {
    pub fn is_found(&self) -> bool {
        matches!(self, Self::Found(_))
    }

    pub fn into_response(self) -> Option<Response> {
        match self {
            Self::Found(response) => Some(response),
            Self::NotFound => None,
        }
    }
}

//! Request/reply RPC plumbing
//!
//! The communicator talks to nodes through [`RpcTransport`], which hands out
//! [`RpcTarget`] channels per address. Calls carry a flat list of typed
//! [`Value`]s each way and fail with an [`RpcError`] carrying an
//! [`ErrorCode`].

pub mod connection;
pub mod tcp;

pub use connection::NodeConnection;
pub use tcp::{RpcHandler, RpcServer, TcpTransport};

use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// A single RPC parameter or return value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Value {
    Int8(u8),
    Int32(i32),
    Int64(i64),
    String(String),
    Data(Vec<u8>),
}

impl Value {
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Int8(_) => "int8",
            Value::Int32(_) => "int32",
            Value::Int64(_) => "int64",
            Value::String(_) => "string",
            Value::Data(_) => "data",
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i32(&self) -> Option<i32> {
        match self {
            Value::Int32(v) => Some(*v),
            _ => None,
        }
    }
}

/// Outbound call: method name plus parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub params: Vec<Value>,
}

impl Request {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            params: Vec::new(),
        }
    }

    pub fn with_param(mut self, value: Value) -> Self {
        self.params.push(value);
        self
    }
}

/// RPC error codes. Codes outside the known range are application codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    GeneralError,
    NotImplemented,
    Abort,
    Timeout,
    Connection,
    BadRequest,
    NoSuchMethod,
    WrongParams,
    Overload,
    WrongReturn,
    BadReply,
    MethodFailed,
    PermissionDenied,
    Application(u32),
}

impl ErrorCode {
    pub fn code(&self) -> u32 {
        match self {
            ErrorCode::GeneralError => 100,
            ErrorCode::NotImplemented => 101,
            ErrorCode::Abort => 102,
            ErrorCode::Timeout => 103,
            ErrorCode::Connection => 104,
            ErrorCode::BadRequest => 105,
            ErrorCode::NoSuchMethod => 106,
            ErrorCode::WrongParams => 107,
            ErrorCode::Overload => 108,
            ErrorCode::WrongReturn => 109,
            ErrorCode::BadReply => 110,
            ErrorCode::MethodFailed => 111,
            ErrorCode::PermissionDenied => 112,
            ErrorCode::Application(code) => *code,
        }
    }

    pub fn from_code(code: u32) -> Self {
        match code {
            100 => ErrorCode::GeneralError,
            101 => ErrorCode::NotImplemented,
            102 => ErrorCode::Abort,
            103 => ErrorCode::Timeout,
            104 => ErrorCode::Connection,
            105 => ErrorCode::BadRequest,
            106 => ErrorCode::NoSuchMethod,
            107 => ErrorCode::WrongParams,
            108 => ErrorCode::Overload,
            109 => ErrorCode::WrongReturn,
            110 => ErrorCode::BadReply,
            111 => ErrorCode::MethodFailed,
            112 => ErrorCode::PermissionDenied,
            other => ErrorCode::Application(other),
        }
    }

    /// Connection refused, timed out or aborted locally.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            ErrorCode::Abort | ErrorCode::Timeout | ErrorCode::Connection
        )
    }

    /// The peer did not understand the request or answered in an unexpected shape.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            ErrorCode::NotImplemented
                | ErrorCode::BadRequest
                | ErrorCode::NoSuchMethod
                | ErrorCode::WrongParams
                | ErrorCode::WrongReturn
                | ErrorCode::BadReply
        )
    }
}

/// Failed RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl fmt::Display for RpcError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RPC error {} ({:?}): {}", self.code.code(), self.code, self.message)
    }
}

impl std::error::Error for RpcError {}

/// Return values of a successful call, or the failure.
pub type RpcResult = std::result::Result<Vec<Value>, RpcError>;

/// Channel to one remote address.
#[async_trait]
pub trait RpcTarget: Send + Sync {
    /// Address this target was created for.
    fn address(&self) -> &str;

    /// False once the underlying channel has failed; the owner must replace it.
    fn is_valid(&self) -> bool;

    /// Invoke a method, failing with [`ErrorCode::Timeout`] after `timeout`.
    async fn invoke(&self, request: Request, timeout: Duration) -> RpcResult;
}

/// Factory for [`RpcTarget`]s.
pub trait RpcTransport: Send + Sync {
    /// Create a target for `address`. Fails synchronously on addresses that
    /// cannot be used; the actual connection may be established lazily.
    fn connect(&self, address: &str) -> Result<Arc<dyn RpcTarget>>;
}

//! Request/response model carried over a link
//!
//! Only the envelope is binary. Bodies are small JSON documents: the
//! per-operation encoding is owned by the data store, this crate just needs
//! a stable shape to correlate, route and classify responses.
pub mod frame;

use std::fmt;
use std::time::Instant;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{PoolError, PoolResult};
pub use frame::{Frame, FrameError};

/// Response code of a successful request
pub const RESPONSE_OK: u32 = 0;

/// Bit set in the response code of a failed request; the rest is the error code
pub const RESPONSE_ERROR_FLAG: u32 = 0x8000;

/// Code of the unsolicited frame a server sends when a link opens
pub const GREETING: u32 = 0xFFFF_0000;

/// Banner every compatible server announces in its greeting
pub const GREETING_BANNER: &str = "Tarantool";

/// Expression used by the monitor to learn a node's role
pub const ROLE_PROBE_EXPR: &str = "return box.info.ro";

/// Request codes understood by the data store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    Select,
    Insert,
    Replace,
    Update,
    Delete,
    Call16,
    Auth,
    Eval,
    Upsert,
    Call17,
    Ping,
}

impl Opcode {
    pub fn code(self) -> u32 {
        match self {
            Opcode::Select => 1,
            Opcode::Insert => 2,
            Opcode::Replace => 3,
            Opcode::Update => 4,
            Opcode::Delete => 5,
            Opcode::Call16 => 6,
            Opcode::Auth => 7,
            Opcode::Eval => 8,
            Opcode::Upsert => 9,
            Opcode::Call17 => 10,
            Opcode::Ping => 64,
        }
    }

    pub fn from_code(code: u32) -> Option<Self> {
        let opcode = match code {
            1 => Opcode::Select,
            2 => Opcode::Insert,
            3 => Opcode::Replace,
            4 => Opcode::Update,
            5 => Opcode::Delete,
            6 => Opcode::Call16,
            7 => Opcode::Auth,
            8 => Opcode::Eval,
            9 => Opcode::Upsert,
            10 => Opcode::Call17,
            64 => Opcode::Ping,
            _ => return None,
        };
        Some(opcode)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Opcode::Select => "select",
            Opcode::Insert => "insert",
            Opcode::Replace => "replace",
            Opcode::Update => "update",
            Opcode::Delete => "delete",
            Opcode::Call16 => "call",
            Opcode::Auth => "auth",
            Opcode::Eval => "eval",
            Opcode::Upsert => "upsert",
            Opcode::Call17 => "call17",
            Opcode::Ping => "ping",
        };
        f.write_str(name)
    }
}

/// Arguments of a data operation.
///
/// Spaces and indexes may be given by name or by numeric id, keys and tuples
/// are arbitrary JSON values, so any `Into<Value>` works.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Operation {
    Select {
        space: Value,
        index: Value,
        offset: u32,
        limit: u32,
        iterator: u32,
        key: Value,
    },
    Insert {
        space: Value,
        tuple: Value,
    },
    Replace {
        space: Value,
        tuple: Value,
    },
    Delete {
        space: Value,
        index: Value,
        key: Value,
    },
    Update {
        space: Value,
        index: Value,
        key: Value,
        ops: Value,
    },
    Upsert {
        space: Value,
        tuple: Value,
        ops: Value,
    },
    Call16 {
        function: String,
        args: Value,
    },
    Call17 {
        function: String,
        args: Value,
    },
    Eval {
        expr: String,
        args: Value,
    },
    Ping,
}

impl Operation {
    pub fn opcode(&self) -> Opcode {
        match self {
            Operation::Select { .. } => Opcode::Select,
            Operation::Insert { .. } => Opcode::Insert,
            Operation::Replace { .. } => Opcode::Replace,
            Operation::Delete { .. } => Opcode::Delete,
            Operation::Update { .. } => Opcode::Update,
            Operation::Upsert { .. } => Opcode::Upsert,
            Operation::Call16 { .. } => Opcode::Call16,
            Operation::Call17 { .. } => Opcode::Call17,
            Operation::Eval { .. } => Opcode::Eval,
            Operation::Ping => Opcode::Ping,
        }
    }

    /// Build a request carrying this operation
    pub fn into_request(self, deadline: Instant) -> PoolResult<Request> {
        let body = match self {
            Operation::Ping => Bytes::new(),
            ref op => serde_json::to_vec(op).map(Bytes::from).map_err(|e| {
                PoolError::protocol(format!("Failed to encode {}: {}", op.opcode(), e))
            })?,
        };
        Ok(Request::new(self.opcode(), body, deadline))
    }
}

/// A request on its way to one connection; the sync id is assigned on send
#[derive(Debug, Clone)]
pub struct Request {
    pub opcode: Opcode,
    pub body: Bytes,
    pub deadline: Instant,
}

impl Request {
    pub fn new(opcode: Opcode, body: Bytes, deadline: Instant) -> Self {
        Self {
            opcode,
            body,
            deadline,
        }
    }

    pub fn to_frame(&self, sync: u64) -> Frame {
        Frame::new(self.opcode.code(), sync, self.body.clone())
    }
}

/// A response matched to its request
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub code: u32,
    pub sync: u64,
    pub body: Bytes,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct DataBody {
    #[serde(default)]
    pub data: Vec<Value>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

impl Response {
    pub fn from_frame(frame: Frame) -> Self {
        Self {
            code: frame.code,
            sync: frame.sync,
            body: frame.body,
        }
    }

    pub fn is_error(&self) -> bool {
        self.code & RESPONSE_ERROR_FLAG != 0
    }

    /// Turn an error response into [`PoolError::Server`], untouched otherwise
    pub fn into_result(self) -> PoolResult<Self> {
        if !self.is_error() {
            return Ok(self);
        }
        let message = serde_json::from_slice::<ErrorBody>(&self.body)
            .map(|body| body.error)
            .unwrap_or_else(|_| String::from_utf8_lossy(&self.body).into_owned());
        Err(PoolError::Server {
            code: self.code & !RESPONSE_ERROR_FLAG,
            message,
        })
    }

    /// Decoded result tuples; an empty body means no data
    pub fn data(&self) -> PoolResult<Vec<Value>> {
        if self.body.is_empty() {
            return Ok(Vec::new());
        }
        serde_json::from_slice::<DataBody>(&self.body)
            .map(|body| body.data)
            .map_err(|e| PoolError::protocol(format!("Malformed response body: {}", e)))
    }
}

/// First frame a server sends on a new link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Greeting {
    /// e.g. "Tarantool 2.11.1"
    pub server: String,
    /// Hex encoded per-link salt used for authentication
    pub salt: String,
}

impl Greeting {
    pub fn is_compatible(&self) -> bool {
        self.server.starts_with(GREETING_BANNER)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthBody {
    pub user: String,
    /// Hex encoded scramble, see [`scramble`]
    pub scramble: String,
}

/// Password proof that never puts the password itself on the wire:
/// `sha256(password) XOR sha256(salt ++ sha256(sha256(password)))`.
pub fn scramble(salt: &[u8], password: &str) -> Vec<u8> {
    let step1 = Sha256::digest(password.as_bytes());
    let step2 = Sha256::digest(step1);

    let mut hasher = Sha256::new();
    hasher.update(salt);
    hasher.update(step2);
    let step3 = hasher.finalize();

    step1.iter().zip(step3.iter()).map(|(a, b)| a ^ b).collect()
}

/// Build the auth request body for `user`/`password` against a greeting
pub fn auth_body(greeting: &Greeting, user: &str, password: &str) -> PoolResult<Bytes> {
    let salt = hex::decode(&greeting.salt)
        .map_err(|e| PoolError::protocol(format!("Invalid greeting salt: {}", e)))?;
    let body = AuthBody {
        user: user.to_string(),
        scramble: hex::encode(scramble(&salt, password)),
    };
    serde_json::to_vec(&body)
        .map(Bytes::from)
        .map_err(|e| PoolError::protocol(format!("Failed to encode auth body: {}", e)))
}

/// Body of a data response, used by servers and tests
pub fn data_body(data: Vec<Value>) -> Bytes {
    serde_json::to_vec(&DataBody { data })
        .map(Bytes::from)
        .unwrap_or_default()
}

/// Body of an error response, used by servers and tests
pub fn error_body(message: &str) -> Bytes {
    serde_json::to_vec(&ErrorBody {
        error: message.to_string(),
    })
    .map(Bytes::from)
    .unwrap_or_default()
}

//! Stratum JSON-RPC message definitions

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Well-known stratum method names
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StratumMethod {
    /// Client subscribes to mining notifications
    Subscribe,
    /// Client authorizes with its wallet address
    Authorize,
    /// Client submits a share
    Submit,
    /// Server notifies client of new work
    Notify,
    /// Server sets share difficulty
    SetDifficulty,
    /// Server assigns the extranonce prefix
    SetExtranonce,
}

impl StratumMethod {
    /// Wire name of the method
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Subscribe => "mining.subscribe",
            Self::Authorize => "mining.authorize",
            Self::Submit => "mining.submit",
            Self::Notify => "mining.notify",
            Self::SetDifficulty => "mining.set_difficulty",
            Self::SetExtranonce => "set_extranonce",
        }
    }
}

impl std::fmt::Display for StratumMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inbound request or outbound unsolicited event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcEvent {
    /// Correlation token, `null` for unsolicited events
    #[serde(default)]
    pub id: Value,
    /// Protocol version tag
    #[serde(rename = "jsonrpc", default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    /// Method name
    pub method: String,
    /// Loosely typed positional parameters
    #[serde(default)]
    pub params: Vec<Value>,
}

impl JsonRpcEvent {
    /// Create a request event
    pub fn new(id: impl Into<Value>, method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: id.into(),
            version: Some("2.0".to_string()),
            method: method.into(),
            params,
        }
    }

    /// Create an unsolicited event carrying no correlation id
    pub fn notification(method: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            id: Value::Null,
            version: Some("2.0".to_string()),
            method: method.into(),
            params,
        }
    }

    /// Parse a single line received from a miner
    pub fn from_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line.trim())
    }

    /// First parameter as a string, if present and of string type
    pub fn string_param(&self, index: usize) -> Option<&str> {
        self.params.get(index).and_then(Value::as_str)
    }
}

/// Response correlated to a request by its id
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcResponse {
    /// Id echoed from the request
    pub id: Value,
    /// Result if successful
    pub result: Value,
    /// Error triple `[code, message, data]` if failed
    pub error: Option<Vec<Value>>,
}

impl JsonRpcResponse {
    /// Create a response to `event`
    pub fn new(event: &JsonRpcEvent, result: Value, error: Option<Vec<Value>>) -> Self {
        Self {
            id: event.id.clone(),
            result,
            error,
        }
    }

    /// Create a successful response to `event`
    pub fn success(event: &JsonRpcEvent, result: Value) -> Self {
        Self::new(event, result, None)
    }

    /// Create a failed response to `event` with a stratum error code
    pub fn failure(event: &JsonRpcEvent, code: i32, message: &str) -> Self {
        Self::new(
            event,
            Value::Null,
            Some(vec![
                Value::from(code),
                Value::String(message.to_string()),
                Value::Null,
            ]),
        )
    }
}

/// Stratum error code for unauthorized workers
pub const ERROR_UNAUTHORIZED_WORKER: i32 = 24;

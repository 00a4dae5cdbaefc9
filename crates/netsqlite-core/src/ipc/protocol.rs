//! Message types and the JSON codec.
//!
//! Every frame carries one UTF-8 JSON document. Requests are a closed set of
//! variants tagged by `method`:
//!
//! ```text
//! {"method":"execute","params":{"query":"SELECT ?","params":[1]}}
//! {"method":"ping"}
//! {"method":"target_database"}
//! {"method":"authenticate","params":{"token":"..."}}
//! ```
//!
//! Responses are either `{"result": <value>}` or a tagged error record
//! `{"error": true, "category": "...", "message": "..."}`. Decoding only ever
//! produces these plain data types, so a hostile peer cannot make the codec
//! construct anything else.

use crate::engine::Rows;
use crate::error::{NetSqliteError, Result};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Status marker returned for `ping`.
pub const PONG: &str = "pong";

/// Status marker returned for a successful `authenticate`.
pub const AUTHENTICATED: &str = "authenticated";

/// A request sent from client to server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", content = "params", rename_all = "snake_case")]
pub enum Request {
    Execute {
        query: String,
        /// Positional parameters. Absent means none.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<Vec<Value>>,
    },
    Ping,
    TargetDatabase,
    Authenticate {
        token: String,
    },
}

impl Request {
    /// Method names the server understands.
    pub const METHODS: [&'static str; 4] = ["execute", "ping", "target_database", "authenticate"];

    pub fn execute(query: impl Into<String>, params: &[Value]) -> Self {
        Request::Execute {
            query: query.into(),
            params: if params.is_empty() {
                None
            } else {
                Some(params.to_vec())
            },
        }
    }

    pub fn authenticate(token: impl Into<String>) -> Self {
        Request::Authenticate {
            token: token.into(),
        }
    }

    /// Method name as it appears on the wire.
    pub fn method(&self) -> &'static str {
        match self {
            Request::Execute { .. } => "execute",
            Request::Ping => "ping",
            Request::TargetDatabase => "target_database",
            Request::Authenticate { .. } => "authenticate",
        }
    }
}

/// A response sent from server to client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Response {
    /// Tagged error record. Listed first so that it wins during decoding.
    Failure(RemoteError),
    Success { result: Value },
}

impl Response {
    pub fn success(result: impl Into<Value>) -> Self {
        Response::Success {
            result: result.into(),
        }
    }

    pub fn failure(err: &NetSqliteError) -> Self {
        Response::Failure(err.to_remote())
    }

    pub fn rows(rows: Rows) -> Self {
        Response::Success {
            result: Value::Array(rows.into_iter().map(Value::Array).collect()),
        }
    }

    /// Unwrap the success value, turning an error record back into an error.
    pub fn into_result(self) -> Result<Value> {
        match self {
            Response::Success { result } => Ok(result),
            Response::Failure(err) => Err(err.into()),
        }
    }
}

/// Error categories carried in error records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    AuthenticationRequired,
    AuthenticationFailed,
    InvalidMessage,
    UnknownMethod,
    EngineError,
    Internal,
    /// A category this build does not know about.
    Unknown,
}

impl ErrorCategory {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::AuthenticationRequired => "authentication_required",
            ErrorCategory::AuthenticationFailed => "authentication_failed",
            ErrorCategory::InvalidMessage => "invalid_message",
            ErrorCategory::UnknownMethod => "unknown_method",
            ErrorCategory::EngineError => "engine_error",
            ErrorCategory::Internal => "internal",
            ErrorCategory::Unknown => "unknown",
        }
    }

    /// Best-effort parse; unrecognised strings map to `Unknown`.
    pub fn parse(s: &str) -> Self {
        match s {
            "authentication_required" => ErrorCategory::AuthenticationRequired,
            "authentication_failed" => ErrorCategory::AuthenticationFailed,
            "invalid_message" => ErrorCategory::InvalidMessage,
            "unknown_method" => ErrorCategory::UnknownMethod,
            "engine_error" => ErrorCategory::EngineError,
            "internal" => ErrorCategory::Internal,
            _ => ErrorCategory::Unknown,
        }
    }
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Tagged error record: `{"error": true, "category": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteError {
    #[serde(deserialize_with = "require_true")]
    pub error: bool,
    pub category: String,
    pub message: String,
    /// Engine error code name, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl RemoteError {
    pub fn new(category: ErrorCategory, message: impl Into<String>) -> Self {
        Self {
            error: true,
            category: category.as_str().to_string(),
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(mut self, code: Option<String>) -> Self {
        self.code = code;
        self
    }
}

fn require_true<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<bool, D::Error> {
    if bool::deserialize(deserializer)? {
        Ok(true)
    } else {
        Err(serde::de::Error::custom("error record must carry `error: true`"))
    }
}

/// Encode a message into a frame payload.
pub fn encode<T: Serialize>(message: &T) -> Result<Vec<u8>> {
    serde_json::to_vec(message).map_err(|e| NetSqliteError::InvalidMessage {
        message: format!("Failed to encode message: {}", e),
    })
}

/// Decode a frame payload into a message.
pub fn decode<T: DeserializeOwned>(payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| NetSqliteError::Decode {
        message: e.to_string(),
    })
}

/// Decode a request frame, telling unknown methods apart from malformed ones.
pub fn parse_request(payload: &[u8]) -> Result<Request> {
    let value: Value = serde_json::from_slice(payload).map_err(|e| {
        NetSqliteError::InvalidMessage {
            message: format!("Parse error: {}", e),
        }
    })?;

    let method = value
        .get("method")
        .and_then(Value::as_str)
        .ok_or_else(|| NetSqliteError::InvalidMessage {
            message: "request must be an object with a string `method` field".to_string(),
        })?
        .to_string();

    if !Request::METHODS.contains(&method.as_str()) {
        return Err(NetSqliteError::UnknownMethod { method });
    }

    serde_json::from_value(value).map_err(|e| NetSqliteError::InvalidMessage {
        message: format!("Malformed `{}` request: {}", method, e),
    })
}

/// Interpret a success value as a row set.
pub fn rows_from_value(value: Value) -> Result<Rows> {
    serde_json::from_value(value).map_err(|e| NetSqliteError::Decode {
        message: format!("expected a sequence of rows: {}", e),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_wire_shape() {
        let ping = serde_json::to_value(Request::Ping).unwrap();
        assert_eq!(ping, json!({"method": "ping"}));

        let exec = serde_json::to_value(Request::execute("SELECT ?", &[json!(1)])).unwrap();
        assert_eq!(
            exec,
            json!({"method": "execute", "params": {"query": "SELECT ?", "params": [1]}})
        );

        let bare = serde_json::to_value(Request::execute("SELECT 1", &[])).unwrap();
        assert_eq!(bare, json!({"method": "execute", "params": {"query": "SELECT 1"}}));
    }

    #[test]
    fn test_request_roundtrip() {
        for request in [
            Request::Ping,
            Request::TargetDatabase,
            Request::authenticate("s3cret"),
            Request::execute("INSERT INTO t VALUES(?, ?)", &[json!("a"), json!(null)]),
        ] {
            let bytes = encode(&request).unwrap();
            assert_eq!(parse_request(&bytes).unwrap(), request);
        }
    }

    #[test]
    fn test_response_preserves_scalars_and_nesting() {
        let values = vec![
            json!("Hello 世界"),
            json!(9_007_199_254_740_991_i64),
            json!(-42),
            json!(12.34),
            json!(true),
            json!(false),
            json!(null),
            json!([[1, "a", null], [2.5, [true, []]]]),
        ];

        for value in values {
            let bytes = encode(&Response::success(value.clone())).unwrap();
            let decoded: Response = decode(&bytes).unwrap();
            assert_eq!(decoded, Response::success(value));
        }
    }

    #[test]
    fn test_error_record_shape() {
        let err = NetSqliteError::Engine {
            message: "no such table: t".into(),
            code: None,
        };
        let wire = serde_json::to_value(Response::failure(&err)).unwrap();

        assert_eq!(
            wire,
            json!({"error": true, "category": "engine_error", "message": "no such table: t"})
        );
    }

    #[test]
    fn test_error_record_decodes_to_error_value() {
        let bytes = br#"{"error": true, "category": "authentication_failed", "message": "Invalid authentication token"}"#;
        let response: Response = decode(bytes).unwrap();

        match response.into_result() {
            Err(NetSqliteError::AuthenticationFailed { message }) => {
                assert_eq!(message, "Invalid authentication token");
            }
            other => panic!("Expected AuthenticationFailed, got: {:?}", other),
        }
    }

    #[test]
    fn test_error_record_with_unknown_category_is_still_an_error() {
        let bytes = br#"{"error": true, "category": "__import__('os')", "message": "boom"}"#;
        let response: Response = decode(bytes).unwrap();

        match response.into_result() {
            Err(NetSqliteError::Internal { message }) => assert_eq!(message, "boom"),
            other => panic!("Expected Internal, got: {:?}", other),
        }
    }

    #[test]
    fn test_error_flag_must_be_true() {
        let bytes = br#"{"error": false, "category": "internal", "message": "x"}"#;
        assert!(matches!(
            decode::<Response>(bytes),
            Err(NetSqliteError::Decode { .. })
        ));
    }

    #[test]
    fn test_malformed_bytes_fail_with_decode_error() {
        for bytes in [&b"not json"[..], b"", b"\xff\xfe", b"{\"result\": "] {
            assert!(matches!(
                decode::<Response>(bytes),
                Err(NetSqliteError::Decode { .. })
            ));
        }
    }

    #[test]
    fn test_parse_request_distinguishes_unknown_from_malformed() {
        assert!(matches!(
            parse_request(br#"{"method": "drop_database"}"#),
            Err(NetSqliteError::UnknownMethod { method }) if method == "drop_database"
        ));
        assert!(matches!(
            parse_request(br#"{"method": "execute", "params": {"sql": 1}}"#),
            Err(NetSqliteError::InvalidMessage { .. })
        ));
        assert!(matches!(
            parse_request(br#"["execute", "SELECT 1"]"#),
            Err(NetSqliteError::InvalidMessage { .. })
        ));
        assert!(matches!(
            parse_request(b"garbage"),
            Err(NetSqliteError::InvalidMessage { .. })
        ));
    }

    #[test]
    fn test_rows_from_value() {
        let rows = rows_from_value(json!([[1, "Alice"], [2, null]])).unwrap();
        assert_eq!(rows, vec![vec![json!(1), json!("Alice")], vec![json!(2), json!(null)]]);

        assert!(rows_from_value(json!("pong")).is_err());
    }
}

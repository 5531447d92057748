use incident_core::error::StoreError;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const CODE_ALREADY_EXISTS: &str = "already_exists";
pub const CODE_UNAVAILABLE: &str = "unavailable";
pub const CODE_INVALID: &str = "invalid";

/// Frames sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ClientFrame {
    Subscribe {
        collection: String,
        req_id: u64,
    },
    Unsubscribe {
        collection: String,
        req_id: u64,
    },
    Create {
        collection: String,
        key: String,
        value: Value,
        req_id: u64,
    },
    Ping {
        req_id: u64,
    },
}

/// Frames sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
pub enum ServerFrame {
    /// Whole collection as `[key, value]` pairs in key order.
    Snapshot {
        collection: String,
        entries: Vec<(String, Value)>,
    },
    Ack(Ack),
    Cancelled {
        collection: String,
        reason: String,
    },
    Pong {
        req_id: u64,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Ack {
    pub req_id: u64,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl Ack {
    pub fn ok(req_id: u64) -> Self {
        Self {
            req_id,
            success: true,
            error: None,
            code: None,
        }
    }

    pub fn failed(req_id: u64, err: &StoreError) -> Self {
        let code = match err {
            StoreError::AlreadyExists(_) => CODE_ALREADY_EXISTS,
            StoreError::Protocol(_) | StoreError::Serialization(_) => CODE_INVALID,
            _ => CODE_UNAVAILABLE,
        };
        Self {
            req_id,
            success: false,
            error: Some(err.to_string()),
            code: Some(code.to_string()),
        }
    }

    /// Map the ack of a write to `key` back onto a store result.
    pub fn into_result(self, key: &str) -> Result<(), StoreError> {
        if self.success {
            return Ok(());
        }
        let message = self.error.unwrap_or_else(|| "request rejected".to_string());
        match self.code.as_deref() {
            Some(CODE_ALREADY_EXISTS) => Err(StoreError::AlreadyExists(key.to_string())),
            Some(CODE_INVALID) => Err(StoreError::Protocol(message)),
            _ => Err(StoreError::Unavailable(message)),
        }
    }
}

/// Build a subscribe frame for a collection.
pub fn subscribe(collection: &str, req_id: u64) -> ClientFrame {
    ClientFrame::Subscribe {
        collection: collection.to_string(),
        req_id,
    }
}

/// Build an unsubscribe frame for a collection.
pub fn unsubscribe(collection: &str, req_id: u64) -> ClientFrame {
    ClientFrame::Unsubscribe {
        collection: collection.to_string(),
        req_id,
    }
}

pub fn create(collection: &str, key: &str, value: Value, req_id: u64) -> ClientFrame {
    ClientFrame::Create {
        collection: collection.to_string(),
        key: key.to_string(),
        value,
        req_id,
    }
}

pub fn ping(req_id: u64) -> ClientFrame {
    ClientFrame::Ping { req_id }
}

/// Parse a raw text frame received by a client.
pub fn parse_server_frame(frame: &str) -> Result<ServerFrame, StoreError> {
    serde_json::from_str(frame).map_err(|e| StoreError::Protocol(format!("bad server frame: {}", e)))
}

/// Parse a raw text frame received by the server.
pub fn parse_client_frame(frame: &str) -> Result<ClientFrame, StoreError> {
    serde_json::from_str(frame).map_err(|e| StoreError::Protocol(format!("bad client frame: {}", e)))
}

pub fn to_text<T: Serialize>(frame: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(frame)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frame_shape() {
        let frame = create("incidentes", "-Nk1", json!({"descripcion": "x"}), 7);
        let value = serde_json::to_value(&frame).unwrap();
        assert_eq!(
            value,
            json!({
                "op": "create",
                "collection": "incidentes",
                "key": "-Nk1",
                "value": {"descripcion": "x"},
                "req_id": 7
            })
        );

        let value = serde_json::to_value(subscribe("incidentes", 1)).unwrap();
        assert_eq!(value, json!({"op": "subscribe", "collection": "incidentes", "req_id": 1}));
    }

    #[test]
    fn test_parse_snapshot() {
        let frame = parse_server_frame(
            r#"{"op":"snapshot","collection":"incidentes","entries":[["a",{"fecha":1}],["b",2]]}"#,
        )
        .unwrap();

        assert_eq!(
            frame,
            ServerFrame::Snapshot {
                collection: "incidentes".to_string(),
                entries: vec![
                    ("a".to_string(), json!({"fecha": 1})),
                    ("b".to_string(), json!(2)),
                ],
            }
        );
    }

    #[test]
    fn test_ack_shape() {
        let value = serde_json::to_value(ServerFrame::Ack(Ack::ok(3))).unwrap();
        assert_eq!(value, json!({"op": "ack", "req_id": 3, "success": true}));

        let parsed = parse_server_frame(r#"{"op":"ack","req_id":4,"success":false,"error":"nope"}"#)
            .unwrap();
        assert_eq!(
            parsed,
            ServerFrame::Ack(Ack {
                req_id: 4,
                success: false,
                error: Some("nope".to_string()),
                code: None,
            })
        );
    }

    #[test]
    fn test_ack_error_mapping() {
        let exists = Ack::failed(1, &StoreError::AlreadyExists("k".to_string()));
        assert_eq!(exists.code.as_deref(), Some(CODE_ALREADY_EXISTS));
        assert_eq!(
            exists.into_result("k"),
            Err(StoreError::AlreadyExists("k".to_string()))
        );

        let down = Ack::failed(2, &StoreError::Io("disk full".to_string()));
        assert!(matches!(down.into_result("k"), Err(StoreError::Unavailable(_))));
        assert_eq!(Ack::ok(3).into_result("k"), Ok(()));
    }

    #[test]
    fn test_unknown_op_rejected() {
        assert!(matches!(
            parse_server_frame(r#"{"op":"book","data":[]}"#),
            Err(StoreError::Protocol(_))
        ));
        assert!(parse_client_frame("not json").is_err());
    }
}

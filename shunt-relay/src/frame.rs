//! OCPP JSON-RPC message framing
//!
//! OCPP uses JSON-RPC style arrays over WebSocket text frames:
//! - CALL: [2, uniqueId, action, payload]
//! - CALLRESULT: [3, uniqueId, payload]
//! - CALLERROR: [4, uniqueId, errorCode, errorDescription, errorDetails]
//!
//! The relay decodes only the outer array shape and the leading message type
//! id. Actions, error codes and payloads stay opaque strings/values so any
//! charge point dialect passes through unmodified. A frame that fails to
//! decode is still forwarded raw by the relay; decoding exists for the snoop
//! stream and the bridge, not as validation.

use serde_json::Value;
use thiserror::Error;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// Errors in OCPP frame decoding
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("frame is not a JSON array")]
    NotAnArray,

    #[error("unknown message type id: {0}")]
    UnknownMessageType(i64),

    #[error("wrong element count for message type: expected {expected}, got {got}")]
    WrongLength { expected: usize, got: usize },

    #[error("frame element has wrong type: {0}")]
    FieldType(&'static str),
}

/// Parsed OCPP frame (any message type)
#[derive(Debug, Clone, PartialEq)]
pub enum OcppFrame {
    Call {
        unique_id: String,
        action: String,
        payload: Value,
    },
    CallResult {
        unique_id: String,
        payload: Value,
    },
    CallError {
        unique_id: String,
        error_code: String,
        error_description: String,
        error_details: Value,
    },
}

impl OcppFrame {
    /// Decode a frame from raw WebSocket text.
    pub fn decode(raw: &str) -> Result<Self, FrameError> {
        let value: Value = serde_json::from_str(raw)?;
        Self::from_value(&value)
    }

    /// Decode a frame from an already-parsed JSON value.
    pub fn from_value(value: &Value) -> Result<Self, FrameError> {
        let array = value.as_array().ok_or(FrameError::NotAnArray)?;
        if array.is_empty() {
            return Err(FrameError::NotAnArray);
        }

        let msg_type = array[0].as_i64().ok_or(FrameError::FieldType("messageTypeId"))?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::WrongLength {
                        expected: 4,
                        got: array.len(),
                    });
                }
                Ok(OcppFrame::Call {
                    unique_id: as_string(&array[1], "uniqueId")?,
                    action: as_string(&array[2], "action")?,
                    payload: array[3].clone(),
                })
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::WrongLength {
                        expected: 3,
                        got: array.len(),
                    });
                }
                Ok(OcppFrame::CallResult {
                    unique_id: as_string(&array[1], "uniqueId")?,
                    payload: array[2].clone(),
                })
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::WrongLength {
                        expected: 5,
                        got: array.len(),
                    });
                }
                Ok(OcppFrame::CallError {
                    unique_id: as_string(&array[1], "uniqueId")?,
                    error_code: as_string(&array[2], "errorCode")?,
                    error_description: as_string(&array[3], "errorDescription")?,
                    error_details: array[4].clone(),
                })
            }
            other => Err(FrameError::UnknownMessageType(other)),
        }
    }

    /// Serialize to the OCPP wire array.
    pub fn encode(&self) -> String {
        let array = match self {
            OcppFrame::Call {
                unique_id,
                action,
                payload,
            } => serde_json::json!([MessageType::Call as i64, unique_id, action, payload]),
            OcppFrame::CallResult { unique_id, payload } => {
                serde_json::json!([MessageType::CallResult as i64, unique_id, payload])
            }
            OcppFrame::CallError {
                unique_id,
                error_code,
                error_description,
                error_details,
            } => serde_json::json!([
                MessageType::CallError as i64,
                unique_id,
                error_code,
                error_description,
                error_details
            ]),
        };
        array.to_string()
    }

    /// The correlation id shared by a Call and its CallResult/CallError.
    pub fn unique_id(&self) -> &str {
        match self {
            OcppFrame::Call { unique_id, .. } => unique_id,
            OcppFrame::CallResult { unique_id, .. } => unique_id,
            OcppFrame::CallError { unique_id, .. } => unique_id,
        }
    }

    /// The action name, present on Call frames only.
    pub fn action(&self) -> Option<&str> {
        match self {
            OcppFrame::Call { action, .. } => Some(action),
            _ => None,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            OcppFrame::Call { .. } => MessageType::Call,
            OcppFrame::CallResult { .. } => MessageType::CallResult,
            OcppFrame::CallError { .. } => MessageType::CallError,
        }
    }

    pub fn payload(&self) -> Option<&Value> {
        match self {
            OcppFrame::Call { payload, .. } => Some(payload),
            OcppFrame::CallResult { payload, .. } => Some(payload),
            OcppFrame::CallError { .. } => None,
        }
    }
}

fn as_string(value: &Value, field: &'static str) -> Result<String, FrameError> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or(FrameError::FieldType(field))
}

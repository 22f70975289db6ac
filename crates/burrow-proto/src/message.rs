//! The frame envelope exchanged on the control link.
//!
//! Every data frame on the link is one JSON object. Optional fields are
//! omitted when empty; an absent field and its zero value are equivalent.
//! Bodies travel as base64 strings.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Frame discriminator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Request,
    Response,
    RequestCancel,
    Ping,
    Pong,
}

/// One message on the control link.
///
/// `request` frames flow broker to client, `response` frames flow back, and
/// `request_cancel` tells the client the broker gave up waiting. The
/// `request_id` correlates a response with the request it answers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub frame_type: FrameType,

    /// Echo of the owning tunnel, set on broker-originated frames.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub tunnel_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub request_id: String,

    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub method: String,

    /// Request target: path plus query.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path: String,

    /// HTTP headers; multiple values per name preserve their order.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, Vec<String>>,

    #[serde(default, with = "body_base64", skip_serializing_if = "Vec::is_empty")]
    pub body: Vec<u8>,

    #[serde(default, skip_serializing_if = "is_zero")]
    pub status: u16,
}

fn is_zero(status: &u16) -> bool {
    *status == 0
}

/// Codec failure when a frame cannot be read off or put on the wire.
#[derive(Debug, Error)]
#[error("frame codec error: {0}")]
pub struct FrameError(#[from] serde_json::Error);

impl Frame {
    pub fn ping() -> Self {
        Self::control(FrameType::Ping)
    }

    pub fn pong() -> Self {
        Self::control(FrameType::Pong)
    }

    fn control(frame_type: FrameType) -> Self {
        Frame {
            frame_type,
            tunnel_id: String::new(),
            request_id: String::new(),
            method: String::new(),
            path: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            status: 0,
        }
    }

    /// A broker-originated request frame.
    pub fn request(
        tunnel_id: impl Into<String>,
        request_id: impl Into<String>,
        method: impl Into<String>,
        path: impl Into<String>,
        headers: HashMap<String, Vec<String>>,
        body: Vec<u8>,
    ) -> Self {
        Frame {
            frame_type: FrameType::Request,
            tunnel_id: tunnel_id.into(),
            request_id: request_id.into(),
            method: method.into(),
            path: path.into(),
            headers,
            body,
            status: 0,
        }
    }

    /// A client-originated response frame.
    pub fn response(
        request_id: impl Into<String>,
        status: u16,
        headers: HashMap<String, Vec<String>>,
        body: Vec<u8>,
    ) -> Self {
        Frame {
            frame_type: FrameType::Response,
            tunnel_id: String::new(),
            request_id: request_id.into(),
            method: String::new(),
            path: String::new(),
            headers,
            body,
            status,
        }
    }

    /// Tells the client the broker stopped waiting on `request_id`.
    pub fn request_cancel(tunnel_id: impl Into<String>, request_id: impl Into<String>) -> Self {
        Frame {
            frame_type: FrameType::RequestCancel,
            tunnel_id: tunnel_id.into(),
            request_id: request_id.into(),
            method: String::new(),
            path: String::new(),
            headers: HashMap::new(),
            body: Vec::new(),
            status: 0,
        }
    }

    /// Encode to the single JSON value carried by one text frame.
    pub fn encode(&self) -> Result<String, FrameError> {
        Ok(serde_json::to_string(self)?)
    }

    /// Decode one text frame. Unknown fields are ignored; missing optional
    /// fields come back as their zero values.
    pub fn decode(text: &str) -> Result<Self, FrameError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Bodies are opaque byte sequences; on the wire they are base64 strings, the
/// standard JSON encoding for bytes.
mod body_base64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(body: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&STANDARD.encode(body))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let encoded = Option::<String>::deserialize(deserializer)?;
        match encoded {
            None => Ok(Vec::new()),
            Some(s) => STANDARD.decode(s).map_err(serde::de::Error::custom),
        }
    }
}

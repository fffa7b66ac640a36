//! Framed control-channel protocol.
//!
//! Every frame on the wire is a UTF-8 text frame carrying one JSON envelope:
//! `{"type": "<discriminator>", "data": {...}}`. The payload is opaque until
//! the caller names the variant it expects; byte bodies travel base64-encoded
//! inside the text frame, so no binary frames are used.

use crate::error::{TunnelError, TunnelResult};
use crate::headers::Headers;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::value::RawValue;
use std::fmt;

/// Protocol version carried in `register`; the server rejects mismatches.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Message discriminators. Serialized as snake_case strings on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MsgType {
    Register,
    Registered,
    HttpRequest,
    HttpResponse,
    Ping,
    Pong,
    Error,
}

impl fmt::Display for MsgType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MsgType::Register => "register",
            MsgType::Registered => "registered",
            MsgType::HttpRequest => "http_request",
            MsgType::HttpResponse => "http_response",
            MsgType::Ping => "ping",
            MsgType::Pong => "pong",
            MsgType::Error => "error",
        };
        f.write_str(name)
    }
}

/// The wire envelope: a discriminator plus an opaque payload.
///
/// `data` stays undecoded until [`Envelope::decode`] names the expected
/// variant; `ping`/`pong` carry no payload at all.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    #[serde(rename = "type")]
    pub msg_type: MsgType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Box<RawValue>>,
}

impl Envelope {
    /// Wrap a typed payload into an envelope.
    pub fn encode<T: Serialize>(msg_type: MsgType, payload: &T) -> TunnelResult<Self> {
        let data = serde_json::value::to_raw_value(payload).map_err(|e| TunnelError::Codec {
            msg_type: msg_type.to_string(),
            detail: e.to_string(),
        })?;
        Ok(Self {
            msg_type,
            data: Some(data),
        })
    }

    /// An envelope with no payload (`ping` / `pong`).
    pub fn bare(msg_type: MsgType) -> Self {
        Self {
            msg_type,
            data: None,
        }
    }

    /// Decode the payload as the named variant.
    ///
    /// Fails if the envelope carries a different discriminator or the payload
    /// does not match the variant's shape.
    pub fn decode<T: DeserializeOwned>(&self, expected: MsgType) -> TunnelResult<T> {
        if self.msg_type != expected {
            return Err(TunnelError::UnexpectedType {
                expected,
                got: self.msg_type,
            });
        }
        let data = self.data.as_ref().ok_or_else(|| TunnelError::Codec {
            msg_type: expected.to_string(),
            detail: "missing payload".into(),
        })?;
        serde_json::from_str(data.get()).map_err(|e| TunnelError::Codec {
            msg_type: expected.to_string(),
            detail: e.to_string(),
        })
    }

    /// Serialize the envelope to its wire form.
    pub fn to_json(&self) -> TunnelResult<String> {
        serde_json::to_string(self).map_err(|e| TunnelError::Codec {
            msg_type: self.msg_type.to_string(),
            detail: e.to_string(),
        })
    }

    /// Parse one wire frame. Unknown discriminators and malformed JSON are
    /// reported as [`TunnelError::InvalidFrame`] naming the offender.
    pub fn from_json(text: &str) -> TunnelResult<Self> {
        serde_json::from_str(text).map_err(|e| TunnelError::InvalidFrame(e.to_string()))
    }
}

/// Sent by the client as the first frame on every channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisterPayload {
    pub domain: String,
    pub protocol_version: String,
}

/// Confirms a successful registration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegisteredPayload {
    pub tunnel_id: String,
    pub server_url: String,
}

/// One buffered public request, forwarded to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpRequestPayload {
    pub request_id: String,
    pub method: String,
    pub path: String,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// The client's answer, correlated by `request_id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpResponsePayload {
    pub request_id: String,
    pub status_code: u16,
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Vec::is_empty", with = "base64_bytes")]
    pub body: Vec<u8>,
}

/// Sent by the server on fatal registration or protocol failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

/// Mint a 128-bit tunnel id, hex-encoded.
pub fn mint_tunnel_id() -> String {
    format!("{:032x}", rand::random::<u128>())
}

/// Mint a 128-bit request id, hex-encoded with the `req-` prefix.
pub fn mint_request_id() -> String {
    format!("req-{:032x}", rand::random::<u128>())
}

/// Byte bodies are base64 strings inside the JSON text frame.
mod base64_bytes {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TunnelError;

    #[test]
    fn register_round_trip() {
        let payload = RegisterPayload {
            domain: "dev.example.com".into(),
            protocol_version: PROTOCOL_VERSION.into(),
        };
        let envelope = Envelope::encode(MsgType::Register, &payload).unwrap();
        let wire = envelope.to_json().unwrap();
        let parsed = Envelope::from_json(&wire).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Register);
        let decoded: RegisterPayload = parsed.decode(MsgType::Register).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn body_bytes_survive_base64() {
        let body: Vec<u8> = (0u8..=255).collect();
        let payload = HttpRequestPayload {
            request_id: mint_request_id(),
            method: "POST".into(),
            path: "/upload?kind=raw".into(),
            headers: Headers::new(),
            body: body.clone(),
        };
        let wire = Envelope::encode(MsgType::HttpRequest, &payload)
            .unwrap()
            .to_json()
            .unwrap();
        // The wire form is pure text; raw bytes never appear in it.
        assert!(wire.is_ascii());
        let decoded: HttpRequestPayload = Envelope::from_json(&wire)
            .unwrap()
            .decode(MsgType::HttpRequest)
            .unwrap();
        assert_eq!(decoded.body, body);
    }

    #[test]
    fn empty_body_is_omitted_and_defaulted() {
        let payload = HttpResponsePayload {
            request_id: "req-0".into(),
            status_code: 204,
            headers: Headers::new(),
            body: Vec::new(),
        };
        let wire = Envelope::encode(MsgType::HttpResponse, &payload)
            .unwrap()
            .to_json()
            .unwrap();
        assert!(!wire.contains("\"body\""));
        let decoded: HttpResponsePayload = Envelope::from_json(&wire)
            .unwrap()
            .decode(MsgType::HttpResponse)
            .unwrap();
        assert!(decoded.body.is_empty());
    }

    #[test]
    fn decode_rejects_wrong_variant() {
        let envelope = Envelope::encode(
            MsgType::Registered,
            &RegisteredPayload {
                tunnel_id: mint_tunnel_id(),
                server_url: "https://dev.example.com".into(),
            },
        )
        .unwrap();
        let err = envelope
            .decode::<RegisterPayload>(MsgType::Register)
            .unwrap_err();
        match err {
            TunnelError::UnexpectedType { expected, got } => {
                assert_eq!(expected, MsgType::Register);
                assert_eq!(got, MsgType::Registered);
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn decode_reports_payload_shape_mismatch() {
        let wire = r#"{"type":"register","data":{"domain":42}}"#;
        let envelope = Envelope::from_json(wire).unwrap();
        let err = envelope
            .decode::<RegisterPayload>(MsgType::Register)
            .unwrap_err();
        match err {
            TunnelError::Codec { msg_type, .. } => assert_eq!(msg_type, "register"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn unknown_discriminator_names_the_offender() {
        let err = Envelope::from_json(r#"{"type":"teleport","data":{}}"#).unwrap_err();
        match err {
            TunnelError::InvalidFrame(detail) => assert!(detail.contains("teleport")),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ping_has_no_payload() {
        let wire = Envelope::bare(MsgType::Ping).to_json().unwrap();
        assert_eq!(wire, r#"{"type":"ping"}"#);
        let parsed = Envelope::from_json(&wire).unwrap();
        assert_eq!(parsed.msg_type, MsgType::Ping);
        assert!(parsed.data.is_none());
    }

    #[test]
    fn request_ids_are_prefixed_hex() {
        let id = mint_request_id();
        assert!(id.starts_with("req-"));
        assert_eq!(id.len(), 4 + 32);
        assert!(id[4..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_ne!(id, mint_request_id());
    }

    #[test]
    fn tunnel_ids_are_hex() {
        let id = mint_tunnel_id();
        assert_eq!(id.len(), 32);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }
}

//! JSON messages and typed binary events of the Miniserver protocol.

pub mod events;
pub mod header;

pub use events::{read_text_events, read_value_events, LoxoneUuid, TextEvent, ValueEvent};
pub use header::{MessageHeader, MessageKind, FRAME_MAGIC};

use crate::command::ResponseCategory;
use crate::error::Result;
use chrono::{DateTime, Utc};
use serde::de::{Deserializer, Error as _};
use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;

/// Loxone counts token validity from its own epoch
const LOXONE_EPOCH_UNIX: i64 = 1_230_768_000; // 2009-01-01T00:00:00Z

/// JSON command response envelope.
///
/// On the wire the payload sits under an `LL` key and the code arrives as a
/// string or a number, under `Code` or `code`, depending on firmware.
#[derive(Debug, Clone, PartialEq)]
pub struct LoxoneMessage {
    /// Echo of the command this message answers
    pub control: String,
    /// HTTP-like response code, see the session's response taxonomy
    pub code: u16,
    /// Command specific payload
    pub value: Value,
}

impl LoxoneMessage {
    pub fn new(control: impl Into<String>, code: u16, value: Value) -> Self {
        Self {
            control: control.into(),
            code,
            value,
        }
    }
}

#[derive(Deserialize)]
struct Envelope {
    #[serde(rename = "LL")]
    ll: Payload,
}

#[derive(Deserialize)]
struct Payload {
    control: String,
    #[serde(default)]
    value: Value,
    #[serde(rename = "Code", alias = "code", deserialize_with = "code_from_wire")]
    code: u16,
}

fn code_from_wire<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<u16, D::Error> {
    match Value::deserialize(deserializer)? {
        Value::Number(n) => n
            .as_u64()
            .and_then(|n| u16::try_from(n).ok())
            .ok_or_else(|| D::Error::custom("response code out of range")),
        Value::String(s) => s
            .parse::<u16>()
            .map_err(|_| D::Error::custom(format!("invalid response code: {s}"))),
        other => Err(D::Error::custom(format!(
            "unexpected response code representation: {other}"
        ))),
    }
}

impl<'de> Deserialize<'de> for LoxoneMessage {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let envelope = Envelope::deserialize(deserializer)?;
        Ok(Self {
            control: envelope.ll.control,
            code: envelope.ll.code,
            value: envelope.ll.value,
        })
    }
}

impl Serialize for LoxoneMessage {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut outer = serializer.serialize_map(Some(1))?;
        outer.serialize_entry(
            "LL",
            &serde_json::json!({
                "control": self.control,
                "value": self.value,
                "Code": self.code.to_string(),
            }),
        )?;
        outer.end()
    }
}

/// API info served by `jdev/cfg/api`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiInfo {
    /// Miniserver serial number
    #[serde(rename = "snr")]
    pub serial: String,
    /// Firmware version
    pub version: String,
}

/// RSA public key served by `jdev/sys/getPublicKey`, modulus and exponent in base64
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PubKeyInfo {
    pub n: String,
    pub e: String,
}

/// Key material served by `getkey2` and `getvisusalt`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthKey {
    /// HMAC key, hex encoded
    pub key: String,
    /// Salt mixed into the password digest
    pub salt: String,
    /// Digest algorithm name, SHA1 when absent
    #[serde(rename = "hashAlg", default)]
    pub hash_alg: Option<String>,
}

/// Session token served by `gettoken` and `authwithtoken`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub token: String,
    /// Seconds since the Loxone epoch at which the token expires
    #[serde(rename = "validUntil")]
    pub valid_until: i64,
    #[serde(rename = "tokenRights", default)]
    pub rights: Option<u32>,
    #[serde(rename = "unsecurePass", default)]
    pub unsecure_pass: Option<bool>,
}

impl Token {
    /// Absolute expiry instant
    pub fn expires_at(&self) -> DateTime<Utc> {
        DateTime::from_timestamp(LOXONE_EPOCH_UNIX + self.valid_until, 0)
            .unwrap_or_else(Utc::now)
    }

    /// Seconds until expiry, negative once expired
    pub fn seconds_to_expire(&self) -> i64 {
        (self.expires_at() - Utc::now()).num_seconds()
    }
}

/// Command response after JSON decoding
#[derive(Debug, Clone, PartialEq)]
pub enum ParsedResponse {
    /// The usual `LL` envelope
    Message(LoxoneMessage),
    /// Responses outside the envelope, e.g. the structure file
    Raw(Value),
}

/// Decode a text frame according to the response category of the answered command.
pub fn parse_response(text: &str, category: ResponseCategory) -> Result<ParsedResponse> {
    if category.expects_envelope() {
        Ok(ParsedResponse::Message(serde_json::from_str(text)?))
    } else {
        Ok(ParsedResponse::Raw(serde_json::from_str(text)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_envelope_with_string_code() {
        let msg: LoxoneMessage = serde_json::from_str(
            r#"{"LL": {"control": "dev/sys/getkey2/admin", "value": {"key": "41", "salt": "42"}, "Code": "200"}}"#,
        )
        .unwrap();
        assert_eq!(msg.control, "dev/sys/getkey2/admin");
        assert_eq!(msg.code, 200);
        assert_eq!(msg.value["key"], "41");
    }

    #[test]
    fn test_parse_envelope_with_numeric_lowercase_code() {
        let msg: LoxoneMessage =
            serde_json::from_str(r#"{"LL": {"control": "x", "value": 0, "code": 401}}"#).unwrap();
        assert_eq!(msg.code, 401);
    }

    #[test]
    fn test_parse_rejects_missing_envelope() {
        assert!(serde_json::from_str::<LoxoneMessage>(r#"{"control": "x", "Code": "200"}"#).is_err());
    }

    #[test]
    fn test_serialize_round_trip() {
        let msg = LoxoneMessage::new("dev/sps/io/uuid/On", 200, serde_json::json!(1.0));
        let text = serde_json::to_string(&msg).unwrap();
        let back: LoxoneMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(back, msg);
    }

    #[test]
    fn test_parse_response_by_category() {
        let envelope = r#"{"LL": {"control": "testCmd", "value": 0, "Code": "200"}}"#;
        match parse_response(envelope, ResponseCategory::Status).unwrap() {
            ParsedResponse::Message(msg) => assert_eq!(msg.code, 200),
            other => panic!("expected envelope, got {other:?}"),
        }

        let structure = r#"{"lastModified": "2024-01-01 00:00:00"}"#;
        match parse_response(structure, ResponseCategory::App).unwrap() {
            ParsedResponse::Raw(value) => {
                assert_eq!(value["lastModified"], "2024-01-01 00:00:00")
            }
            other => panic!("expected raw value, got {other:?}"),
        }
    }

    #[test]
    fn test_auth_key_optional_hash_alg() {
        let key: AuthKey =
            serde_json::from_str(r#"{"key": "41", "salt": "42"}"#).unwrap();
        assert!(key.hash_alg.is_none());
    }

    #[test]
    fn test_token_expiry_math() {
        let fresh = Token {
            token: "t".into(),
            valid_until: (Utc::now().timestamp() - LOXONE_EPOCH_UNIX) + 3600,
            rights: None,
            unsecure_pass: None,
        };
        let remaining = fresh.seconds_to_expire();
        assert!(remaining > 3500 && remaining <= 3600, "remaining={remaining}");

        let stale = Token {
            token: "t".into(),
            valid_until: (Utc::now().timestamp() - LOXONE_EPOCH_UNIX) - 10,
            rights: None,
            unsecure_pass: None,
        };
        assert!(stale.seconds_to_expire() < 0);
    }
}

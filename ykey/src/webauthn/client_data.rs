//! Collected client data and its JSON serialization
//!
//! The authenticator signs over the SHA-256 of `clientDataJSON`, so the
//! byte-exact serialization matters. [`ClientData::from_fields`] follows the
//! W3C JSON-compatible serialization: fixed member order for the known
//! members, additional members sorted by key, binary values as base64url
//! without padding, and minimal string escaping.

use std::collections::BTreeMap;

use base64::prelude::*;
use sha2::{Digest, Sha256};

/// Members the serialization writes itself; same-named extras are dropped
const RESERVED_KEYS: [&str; 5] = ["type", "challenge", "origin", "crossOrigin", "topOrigin"];

/// The `type` member of the client data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientDataType {
    Create,
    Get,
    Other(&'static str),
}

impl ClientDataType {
    pub fn as_str(self) -> &'static str {
        match self {
            ClientDataType::Create => "webauthn.create",
            ClientDataType::Get => "webauthn.get",
            ClientDataType::Other(value) => value,
        }
    }
}

/// A JSON value for additional client data members
///
/// Objects keep the order their members were given in; only top-level
/// extras are sorted and filtered, nested values are written verbatim.
#[derive(Debug, Clone, PartialEq)]
pub enum JsonValue {
    Null,
    Bool(bool),
    Number(i64),
    String(String),
    /// Written as base64url without padding
    Bytes(Vec<u8>),
    Array(Vec<JsonValue>),
    Object(Vec<(String, JsonValue)>),
}

/// Client data as passed to an authenticator operation
///
/// Either full JSON with its hash, or in pre-hashed flows the hash alone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientData {
    json: Vec<u8>,
    hash: [u8; 32],
}

impl ClientData {
    /// Serialize client data from its members
    ///
    /// `cross_origin` is forced to `true` when a `top_origin` is present,
    /// since an embedded context is by definition not same-origin.
    pub fn from_fields(
        data_type: ClientDataType,
        challenge: &[u8],
        origin: &str,
        cross_origin: bool,
        top_origin: Option<&str>,
        extras: &BTreeMap<String, JsonValue>,
    ) -> Self {
        let cross_origin = cross_origin || top_origin.is_some();
        let mut json = String::new();
        json.push_str("{\"type\":");
        push_string(&mut json, data_type.as_str());
        json.push_str(",\"challenge\":");
        push_string(&mut json, &BASE64_URL_SAFE_NO_PAD.encode(challenge));
        json.push_str(",\"origin\":");
        push_string(&mut json, origin);
        json.push_str(",\"crossOrigin\":");
        json.push_str(if cross_origin { "true" } else { "false" });
        if let Some(top_origin) = top_origin {
            json.push_str(",\"topOrigin\":");
            push_string(&mut json, top_origin);
        }
        for (key, value) in extras {
            if RESERVED_KEYS.contains(&key.as_str()) {
                continue;
            }
            json.push(',');
            push_string(&mut json, key);
            json.push(':');
            push_value(&mut json, value);
        }
        json.push('}');
        Self::from_json(json.into_bytes())
    }

    /// Wrap an existing serialization, hashing it
    pub fn from_json(json: impl Into<Vec<u8>>) -> Self {
        let json = json.into();
        let hash = Sha256::digest(&json).into();
        Self { json, hash }
    }

    /// Wrap a bare hash for flows where the relying party never shares the
    /// serialized client data
    pub fn from_hash(hash: [u8; 32]) -> Self {
        Self { json: Vec::new(), hash }
    }

    /// The serialized client data, empty when built [`from_hash`](Self::from_hash)
    pub fn json(&self) -> &[u8] {
        &self.json
    }

    pub fn hash(&self) -> [u8; 32] {
        self.hash
    }

    pub fn has_json(&self) -> bool {
        !self.json.is_empty()
    }
}

fn push_string(out: &mut String, value: &str) {
    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            ch if (ch as u32) <= 0x1F => {
                out.push_str(&format!("\\u{:04x}", ch as u32));
            }
            ch => out.push(ch),
        }
    }
    out.push('"');
}

fn push_value(out: &mut String, value: &JsonValue) {
    match value {
        JsonValue::Null => out.push_str("null"),
        JsonValue::Bool(value) => out.push_str(if *value { "true" } else { "false" }),
        JsonValue::Number(value) => out.push_str(&value.to_string()),
        JsonValue::String(value) => push_string(out, value),
        JsonValue::Bytes(value) => push_string(out, &BASE64_URL_SAFE_NO_PAD.encode(value)),
        JsonValue::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                push_value(out, item);
            }
            out.push(']');
        }
        JsonValue::Object(members) => {
            out.push('{');
            for (index, (key, item)) in members.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                push_string(out, key);
                out.push(':');
                push_value(out, item);
            }
            out.push('}');
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn json_string(data: &ClientData) -> String {
        String::from_utf8(data.json().to_vec()).unwrap()
    }

    #[test]
    fn test_fixed_member_order() {
        let data = ClientData::from_fields(
            ClientDataType::Create,
            &[0, 1, 2, 3],
            "https://example.com",
            false,
            None,
            &BTreeMap::new(),
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.create","challenge":"AAECAw","origin":"https://example.com","crossOrigin":false}"#
        );
    }

    #[test]
    fn test_hash_is_sha256_of_json() {
        let data = ClientData::from_fields(
            ClientDataType::Get,
            &[1, 2],
            "https://example.com",
            false,
            None,
            &BTreeMap::new(),
        );
        let expected: [u8; 32] = Sha256::digest(data.json()).into();
        assert_eq!(data.hash(), expected);
        assert!(data.has_json());
    }

    #[test]
    fn test_cross_origin_forced_by_top_origin() {
        let data = ClientData::from_fields(
            ClientDataType::Get,
            &[9],
            "https://sub.example",
            false,
            Some("https://example"),
            &BTreeMap::new(),
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.get","challenge":"CQ","origin":"https://sub.example","crossOrigin":true,"topOrigin":"https://example"}"#
        );
    }

    #[test]
    fn test_reserved_keys_dropped_and_extras_sorted() {
        let mut extras = BTreeMap::new();
        extras.insert("zKey".to_string(), JsonValue::String("value".to_string()));
        extras.insert("aKey".to_string(), JsonValue::Number(123));
        extras.insert("mid".to_string(), JsonValue::Bytes(vec![10, 11, 12]));
        extras.insert("type".to_string(), JsonValue::String("evil".to_string()));
        extras.insert("challenge".to_string(), JsonValue::String("evil".to_string()));
        extras.insert("origin".to_string(), JsonValue::String("evil".to_string()));
        extras.insert("crossOrigin".to_string(), JsonValue::Bool(false));
        extras.insert("topOrigin".to_string(), JsonValue::String("evil".to_string()));

        let data = ClientData::from_fields(
            ClientDataType::Create,
            &[5, 6],
            "https://x",
            true,
            None,
            &extras,
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.create","challenge":"BQY","origin":"https://x","crossOrigin":true,"aKey":123,"mid":"CgsM","zKey":"value"}"#
        );
    }

    #[test]
    fn test_null_and_empty_binary_members() {
        let mut extras = BTreeMap::new();
        extras.insert("empty".to_string(), JsonValue::Bytes(Vec::new()));
        extras.insert("missing".to_string(), JsonValue::Null);

        let data = ClientData::from_fields(
            ClientDataType::Get,
            &[9],
            "https://x",
            false,
            None,
            &extras,
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.get","challenge":"CQ","origin":"https://x","crossOrigin":false,"empty":"","missing":null}"#
        );
    }

    #[test]
    fn test_control_quote_and_backslash_escaping() {
        let mut extras = BTreeMap::new();
        extras.insert("note".to_string(), JsonValue::String("A\u{1}B\tC".to_string()));
        extras.insert(
            "quote".to_string(),
            JsonValue::String(r#"He said "Hi\Bye""#.to_string()),
        );

        let data = ClientData::from_fields(
            ClientDataType::Get,
            &[9],
            "https://ex\n.com",
            false,
            None,
            &extras,
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.get","challenge":"CQ","origin":"https://ex\u000a.com","crossOrigin":false,"note":"A\u0001B\u0009C","quote":"He said \"Hi\\Bye\""}"#
        );
    }

    #[test]
    fn test_nested_members_keep_given_order() {
        let mut extras = BTreeMap::new();
        extras.insert(
            "outer".to_string(),
            JsonValue::Object(vec![
                ("z".to_string(), JsonValue::Number(1)),
                ("a".to_string(), JsonValue::Number(2)),
                ("type".to_string(), JsonValue::String("kept".to_string())),
            ]),
        );
        extras.insert(
            "list".to_string(),
            JsonValue::Array(vec![JsonValue::Bool(true), JsonValue::Bytes(vec![3, 4])]),
        );

        let data = ClientData::from_fields(
            ClientDataType::Create,
            &[9],
            "https://x",
            false,
            None,
            &extras,
        );
        assert_eq!(
            json_string(&data),
            r#"{"type":"webauthn.create","challenge":"CQ","origin":"https://x","crossOrigin":false,"list":[true,"AwQ"],"outer":{"z":1,"a":2,"type":"kept"}}"#
        );
    }

    #[test]
    fn test_long_challenge_has_no_padding() {
        let data = ClientData::from_fields(
            ClientDataType::Get,
            &[0xFF; 32],
            "https://x",
            false,
            None,
            &BTreeMap::new(),
        );
        let json = json_string(&data);
        assert!(!json.contains('='));
        assert!(json.contains(r#""challenge":"__"#));
    }

    #[test]
    fn test_from_hash_and_from_json() {
        let raw = br#"{"x":1}"#.to_vec();
        let expected: [u8; 32] = Sha256::digest(&raw).into();
        let data = ClientData::from_json(raw);
        assert_eq!(data.hash(), expected);
        assert!(data.has_json());

        let hashed = ClientData::from_hash([7; 32]);
        assert_eq!(hashed.hash(), [7; 32]);
        assert!(hashed.json().is_empty());
        assert!(!hashed.has_json());
    }

    #[test]
    fn test_custom_type_written_verbatim() {
        let data = ClientData::from_fields(
            ClientDataType::Other("payment.get"),
            &[9],
            "https://x",
            false,
            None,
            &BTreeMap::new(),
        );
        assert!(json_string(&data).starts_with(r#"{"type":"payment.get","#));
    }
}

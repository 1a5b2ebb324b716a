//! CTAP2 wire-level data types
//!
//! Field declaration order matters for the serializable types: cbor4ii
//! writes struct fields in order, and CTAP2 canonical form sorts string keys
//! by length before lexicographic order.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ykey_core::error::Result;

use crate::cbor::{self, MapParser, Value};

/// Credential type string used throughout WebAuthn and CTAP
pub const PUBLIC_KEY_TYPE: &str = "public-key";

/// COSE algorithm identifier for ES256
pub const ES256_ALGORITHM: i64 = -7;

/// A relying party entity (makeCredential 0x02)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelyingPartyEntity {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

/// A user entity (makeCredential 0x03)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntity {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

/// A credential algorithm choice (makeCredential 0x04 entries)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialParameters {
    pub alg: i64,
    #[serde(rename = "type")]
    pub cred_type: String,
}

impl CredentialParameters {
    pub fn es256() -> Self {
        Self {
            alg: ES256_ALGORITHM,
            cred_type: PUBLIC_KEY_TYPE.into(),
        }
    }
}

/// A credential reference (allowList / excludeList entries)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialDescriptor {
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,
    #[serde(rename = "type")]
    pub cred_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transports: Option<Vec<String>>,
}

impl CredentialDescriptor {
    pub fn new(id: impl Into<Vec<u8>>) -> Self {
        Self {
            id: id.into(),
            cred_type: PUBLIC_KEY_TYPE.into(),
            transports: None,
        }
    }
}

/// Arguments to authenticatorMakeCredential
#[derive(Debug, Clone)]
pub struct MakeCredentialRequest {
    pub client_data_hash: Vec<u8>,
    pub rp: RelyingPartyEntity,
    pub user: UserEntity,
    pub pub_key_cred_params: Vec<CredentialParameters>,
    pub exclude_list: Vec<CredentialDescriptor>,
    pub extensions: Option<Value>,
    pub options: Option<BTreeMap<String, bool>>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
}

/// A parsed authenticatorMakeCredential response
#[derive(Debug, Clone)]
pub struct AttestationResponse {
    pub format: String,
    pub auth_data: Vec<u8>,
    pub att_stmt: Value,
    pub ep_att: Option<bool>,
    pub large_blob_key: Option<Vec<u8>>,
}

impl AttestationResponse {
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let map = MapParser::from_bytes(data)?;
        Ok(Self {
            format: map.get(1)?,
            auth_data: map.get_bytes(2)?,
            att_stmt: map.get(3)?,
            ep_att: map.get_opt(4)?,
            large_blob_key: map.get_bytes_opt(5)?,
        })
    }
}

/// Arguments to authenticatorGetAssertion
#[derive(Debug, Clone)]
pub struct GetAssertionRequest {
    pub rp_id: String,
    pub client_data_hash: Vec<u8>,
    pub allow_list: Vec<CredentialDescriptor>,
    pub extensions: Option<Value>,
    pub options: Option<BTreeMap<String, bool>>,
    pub pin_uv_auth_param: Option<Vec<u8>>,
    pub pin_uv_auth_protocol: Option<u64>,
}

/// A parsed authenticatorGetAssertion response
#[derive(Debug, Clone)]
pub struct AssertionResponse {
    pub credential: Option<CredentialDescriptor>,
    pub auth_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user: Option<UserEntity>,
    pub number_of_credentials: Option<u64>,
    pub user_selected: Option<bool>,
    pub large_blob_key: Option<Vec<u8>>,
}

impl AssertionResponse {
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let map = MapParser::from_bytes(data)?;
        Ok(Self {
            credential: map.get_opt(1)?,
            auth_data: map.get_bytes(2)?,
            signature: map.get_bytes(3)?,
            user: map.get_opt(4)?,
            number_of_credentials: map.get_opt(5)?,
            user_selected: map.get_opt(6)?,
            large_blob_key: map.get_bytes_opt(7)?,
        })
    }
}

/// Parsed authenticatorGetInfo response
#[derive(Debug, Clone)]
pub struct InfoData {
    pub versions: Vec<String>,
    pub extensions: Vec<String>,
    pub aaguid: Vec<u8>,
    pub options: BTreeMap<String, bool>,
    pub max_msg_size: u64,
    pub pin_uv_auth_protocols: Vec<u64>,
    pub max_credential_count_in_list: Option<u64>,
    pub max_credential_id_length: Option<u64>,
    pub transports: Vec<String>,
    pub algorithms: Option<Value>,
    pub max_serialized_large_blob_array: Option<u64>,
    pub force_pin_change: bool,
    pub min_pin_length: u64,
    pub firmware_version: Option<u64>,
    pub max_cred_blob_length: Option<u64>,
    pub max_rp_ids_for_set_min_pin_length: Option<u64>,
    pub remaining_discoverable_credentials: Option<u64>,
}

impl InfoData {
    pub fn from_cbor(data: &[u8]) -> Result<Self> {
        let map = MapParser::from_bytes(data)?;
        Ok(Self {
            versions: map.get(0x01)?,
            extensions: map.get_opt(0x02)?.unwrap_or_default(),
            aaguid: map.get_bytes(0x03)?,
            options: map.get_opt(0x04)?.unwrap_or_default(),
            max_msg_size: map.get_opt(0x05)?.unwrap_or(1024),
            pin_uv_auth_protocols: map.get_opt(0x06)?.unwrap_or_default(),
            max_credential_count_in_list: map.get_opt(0x07)?,
            max_credential_id_length: map.get_opt(0x08)?,
            transports: map.get_opt(0x09)?.unwrap_or_default(),
            algorithms: map.get_opt(0x0A)?,
            max_serialized_large_blob_array: map.get_opt(0x0B)?,
            force_pin_change: map.get_opt(0x0C)?.unwrap_or(false),
            min_pin_length: map.get_opt(0x0D)?.unwrap_or(4),
            firmware_version: map.get_opt(0x0E)?,
            max_cred_blob_length: map.get_opt(0x0F)?,
            max_rp_ids_for_set_min_pin_length: map.get_opt(0x10)?,
            remaining_discoverable_credentials: map.get_opt(0x14)?,
        })
    }

    /// Value of a boolean option, `None` when the authenticator omits it
    pub fn get_option(&self, name: &str) -> Option<bool> {
        self.options.get(name).copied()
    }

    pub fn supports_extension(&self, name: &str) -> bool {
        self.extensions.iter().any(|ext| ext == name)
    }

    pub fn supports_version(&self, name: &str) -> bool {
        self.versions.iter().any(|version| version == name)
    }
}

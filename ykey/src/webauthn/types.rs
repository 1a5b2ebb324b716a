//! W3C-level request and response models for the WebAuthn client

use ykey_ctap::cbor::Value;
use ykey_ctap::{CredentialDescriptor, CredentialParameters, RelyingPartyEntity, UserEntity};

/// How strongly the relying party wants a discoverable (resident) credential
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResidentKeyRequirement {
    Discouraged,
    Preferred,
    Required,
}

/// How strongly the relying party wants user verification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UserVerificationRequirement {
    Discouraged,
    #[default]
    Preferred,
    Required,
}

/// Authenticator requirements attached to a registration request
#[derive(Debug, Clone, Default)]
pub struct AuthenticatorSelection {
    pub resident_key: Option<ResidentKeyRequirement>,
    pub user_verification: UserVerificationRequirement,
}

/// Parameters for registering a credential
///
/// The challenge is not part of these options: it lives in the client data,
/// which the caller builds separately and passes alongside.
#[derive(Debug, Clone)]
pub struct CreationOptions {
    pub rp: RelyingPartyEntity,
    pub user: UserEntity,
    pub pub_key_cred_params: Vec<CredentialParameters>,
    pub exclude_credentials: Vec<CredentialDescriptor>,
    pub authenticator_selection: Option<AuthenticatorSelection>,
    pub extensions: Option<Value>,
}

/// Parameters for asserting an existing credential
///
/// An empty `allow_credentials` list asks for discoverable credentials.
#[derive(Debug, Clone)]
pub struct RequestOptions {
    /// Defaults to the effective domain when absent
    pub rp_id: Option<String>,
    pub allow_credentials: Vec<CredentialDescriptor>,
    pub user_verification: UserVerificationRequirement,
    pub extensions: Option<Value>,
}

/// The outcome of a registration, ready to return to the relying party
#[derive(Debug, Clone)]
pub struct AuthenticatorAttestationResponse {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    /// CBOR map with `fmt`, `attStmt` and `authData` members
    pub attestation_object: Vec<u8>,
}

/// The outcome of an assertion, ready to return to the relying party
#[derive(Debug, Clone)]
pub struct AuthenticatorAssertionResponse {
    pub credential_id: Vec<u8>,
    pub client_data_json: Vec<u8>,
    pub authenticator_data: Vec<u8>,
    pub signature: Vec<u8>,
    pub user_handle: Option<Vec<u8>>,
}

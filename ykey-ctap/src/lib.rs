//! CTAP2 client protocol for the ykey SDK
//!
//! This crate drives FIDO2 authenticators from the platform side over the
//! transports in `ykey-transport`.
//!
//! Implements the client half of the FIDO2 specification:
//! <https://fidoalliance.org/specs/fido-v2.1-ps-20210615/fido-client-to-authenticator-protocol-v2.1-ps-20210615.html>

pub mod cbor;
pub mod client_pin;
pub mod config;
pub mod ctap2;
pub mod large_blobs;
pub mod status;
pub mod types;

// Re-export commonly used types
pub use client_pin::{preferred_protocol, ClientPin};
pub use config::Config;
pub use ctap2::{CcidBackend, Ctap2Session, CtapBackend, FidoBackend, FIDO_AID};
pub use large_blobs::{BlobEntry, LargeBlobs};
pub use types::{
    AssertionResponse, AttestationResponse, CredentialDescriptor, CredentialParameters,
    GetAssertionRequest, InfoData, MakeCredentialRequest, RelyingPartyEntity, UserEntity,
};

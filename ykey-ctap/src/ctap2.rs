//! CTAP2 command session
//!
//! `Ctap2Session` drives an authenticator through the `CtapBackend` trait.
//! Two backends exist: CTAPHID carries the command byte and CBOR body in a
//! CTAPHID_CBOR message, CCID wraps the same bytes in an APDU after selecting
//! the FIDO applet. The first response byte is the CTAP status code; anything
//! non-zero maps to `Error::Ctap`.

use tracing::debug;

use ykey_core::apdu::Apdu;
use ykey_core::error::{Error, Result};
use ykey_core::state::CommandState;
use ykey_transport::{
    CtapHidCommand, FidoConnection, FidoProtocol, SmartCardConnection, SmartCardProtocol,
};

use crate::cbor::MapBuilder;
use crate::status;
use crate::types::{
    AssertionResponse, AttestationResponse, GetAssertionRequest, InfoData, MakeCredentialRequest,
};

/// FIDO applet identifier
pub const FIDO_AID: [u8; 8] = [0xA0, 0x00, 0x00, 0x06, 0x47, 0x2F, 0x00, 0x01];

pub const CMD_MAKE_CREDENTIAL: u8 = 0x01;
pub const CMD_GET_ASSERTION: u8 = 0x02;
pub const CMD_GET_INFO: u8 = 0x04;
pub const CMD_CLIENT_PIN: u8 = 0x06;
pub const CMD_RESET: u8 = 0x07;
pub const CMD_GET_NEXT_ASSERTION: u8 = 0x08;
pub const CMD_SELECTION: u8 = 0x0B;
pub const CMD_LARGE_BLOBS: u8 = 0x0C;
pub const CMD_CONFIG: u8 = 0x0D;

const INS_CBOR: u8 = 0x10;

/// One CTAP2 command round trip over some transport
pub trait CtapBackend {
    /// Send `command` with its encoded argument map and return the raw
    /// response, status byte included
    fn transact(
        &mut self,
        command: u8,
        payload: &[u8],
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>>;
}

/// CTAPHID transport backend
pub struct FidoBackend<C: FidoConnection> {
    protocol: FidoProtocol<C>,
}

impl<C: FidoConnection> FidoBackend<C> {
    pub fn new(protocol: FidoProtocol<C>) -> Self {
        Self { protocol }
    }
}

impl<C: FidoConnection> CtapBackend for FidoBackend<C> {
    fn transact(
        &mut self,
        command: u8,
        payload: &[u8],
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(command);
        message.extend_from_slice(payload);
        self.protocol
            .send_and_receive(CtapHidCommand::Cbor, &message, state)
    }
}

/// Smart card transport backend
///
/// Keepalive and cancellation are CTAPHID concepts; `state` is ignored here.
pub struct CcidBackend<C: SmartCardConnection> {
    protocol: SmartCardProtocol<C>,
}

impl<C: SmartCardConnection> CcidBackend<C> {
    /// Select the FIDO applet on an open smart card channel
    pub fn new(mut protocol: SmartCardProtocol<C>) -> Result<Self> {
        protocol.select(&FIDO_AID)?;
        Ok(Self { protocol })
    }
}

impl<C: SmartCardConnection> CtapBackend for CcidBackend<C> {
    fn transact(
        &mut self,
        command: u8,
        payload: &[u8],
        _state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let mut message = Vec::with_capacity(1 + payload.len());
        message.push(command);
        message.extend_from_slice(payload);
        self.protocol
            .send_and_receive(&Apdu::new(0x80, INS_CBOR, 0, 0, message))
    }
}

/// A live CTAP2 session with cached authenticatorGetInfo data
pub struct Ctap2Session<B: CtapBackend> {
    backend: B,
    info: InfoData,
}

impl<B: CtapBackend> Ctap2Session<B> {
    /// Open a session; fetches authenticatorGetInfo up front
    pub fn new(mut backend: B) -> Result<Self> {
        let response = backend.transact(CMD_GET_INFO, &[], None)?;
        let info = InfoData::from_cbor(check_status(&response)?)?;
        debug!(versions = ?info.versions, "CTAP2 session opened");
        Ok(Self { backend, info })
    }

    pub fn info(&self) -> &InfoData {
        &self.info
    }

    /// Access the underlying transport backend
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Send one CTAP2 command and return the CBOR response body
    pub fn send_cbor(
        &mut self,
        command: u8,
        payload: Option<&[u8]>,
        state: Option<&CommandState>,
    ) -> Result<Vec<u8>> {
        let response = self
            .backend
            .transact(command, payload.unwrap_or(&[]), state)?;
        Ok(check_status(&response)?.to_vec())
    }

    pub fn make_credential(
        &mut self,
        request: &MakeCredentialRequest,
        state: Option<&CommandState>,
    ) -> Result<AttestationResponse> {
        let mut builder = MapBuilder::new()
            .insert_bytes(1, &request.client_data_hash)?
            .insert(2, &request.rp)?
            .insert(3, &request.user)?
            .insert(4, &request.pub_key_cred_params)?;
        if !request.exclude_list.is_empty() {
            builder = builder.insert(5, &request.exclude_list)?;
        }
        let args = builder
            .insert_opt(6, request.extensions.as_ref())?
            .insert_opt(7, request.options.as_ref())?
            .insert_bytes_opt(8, request.pin_uv_auth_param.as_deref())?
            .insert_opt(9, request.pin_uv_auth_protocol)?
            .build()?;
        let response = self.send_cbor(CMD_MAKE_CREDENTIAL, Some(&args), state)?;
        AttestationResponse::from_cbor(&response)
    }

    /// Run authenticatorGetAssertion and drain the getNextAssertion chain
    /// when the authenticator reports more than one match
    pub fn get_assertions(
        &mut self,
        request: &GetAssertionRequest,
        state: Option<&CommandState>,
    ) -> Result<Vec<AssertionResponse>> {
        let mut builder = MapBuilder::new()
            .insert(1, &request.rp_id)?
            .insert_bytes(2, &request.client_data_hash)?;
        if !request.allow_list.is_empty() {
            builder = builder.insert(3, &request.allow_list)?;
        }
        let args = builder
            .insert_opt(4, request.extensions.as_ref())?
            .insert_opt(5, request.options.as_ref())?
            .insert_bytes_opt(6, request.pin_uv_auth_param.as_deref())?
            .insert_opt(7, request.pin_uv_auth_protocol)?
            .build()?;
        let response = self.send_cbor(CMD_GET_ASSERTION, Some(&args), state)?;
        let first = AssertionResponse::from_cbor(&response)?;
        let count = first.number_of_credentials.unwrap_or(1);
        let mut assertions = vec![first];
        for _ in 1..count {
            let response = self.send_cbor(CMD_GET_NEXT_ASSERTION, None, state)?;
            assertions.push(AssertionResponse::from_cbor(&response)?);
        }
        Ok(assertions)
    }

    /// Factory reset; requires user presence shortly after power-up
    pub fn reset(&mut self, state: Option<&CommandState>) -> Result<()> {
        self.send_cbor(CMD_RESET, None, state)?;
        Ok(())
    }

    /// Ask the authenticator to prove presence, e.g. to pick one of several
    /// connected devices
    pub fn selection(&mut self, state: Option<&CommandState>) -> Result<()> {
        self.send_cbor(CMD_SELECTION, None, state)?;
        Ok(())
    }
}

fn check_status(response: &[u8]) -> Result<&[u8]> {
    let code = *response
        .first()
        .ok_or_else(|| Error::bad_response("empty CTAP response"))?;
    if code != status::OK {
        return Err(Error::Ctap(code));
    }
    Ok(&response[1..])
}

//! WebAuthn client on top of a CTAP2 authenticator
//!
//! Maps W3C-level registration and assertion requests onto CTAP2 commands:
//! RP ID validation, PIN/UV token acquisition, allow-list pre-flight in
//! capability-sized chunks, and re-encoding of the responses into the
//! shapes a relying party expects.
//!
//! ## Example
//!
//! ```no_run
//! # use ykey::webauthn::{ClientData, ClientDataType, CreationOptions, WebAuthnClient};
//! # use ykey_ctap::{CredentialParameters, RelyingPartyEntity, UserEntity};
//! # fn run(
//! #     ctap: ykey_ctap::Ctap2Session<impl ykey_ctap::CtapBackend>,
//! # ) -> Result<(), ykey::webauthn::ClientError> {
//! let mut client = WebAuthnClient::new(ctap);
//! let client_data = ClientData::from_fields(
//!     ClientDataType::Create,
//!     b"server challenge",
//!     "https://example.com",
//!     false,
//!     None,
//!     &Default::default(),
//! );
//! let options = CreationOptions {
//!     rp: RelyingPartyEntity { id: "example.com".into(), name: None },
//!     user: UserEntity { id: vec![1], name: Some("user".into()), display_name: None },
//!     pub_key_cred_params: vec![CredentialParameters::es256()],
//!     exclude_credentials: Vec::new(),
//!     authenticator_selection: None,
//!     extensions: None,
//! };
//! let response = client.make_credential(&client_data, &options, "example.com", None, None)?;
//! # Ok(())
//! # }
//! ```

mod client_data;
mod flow;
mod types;

pub use client_data::{ClientData, ClientDataType, JsonValue};
pub use flow::{FailureReason, FlowEvent, FlowState, OperationFlow};
pub use types::{
    AuthenticatorAssertionResponse, AuthenticatorAttestationResponse, AuthenticatorSelection,
    CreationOptions, RequestOptions, ResidentKeyRequirement, UserVerificationRequirement,
};

use std::collections::BTreeMap;
use std::fmt;

use tracing::debug;
use zeroize::Zeroizing;

use ykey_core::error::Error;
use ykey_core::state::CommandState;
use ykey_crypto::PinUvAuthProtocol;
use ykey_ctap::cbor::{self, Value};
use ykey_ctap::client_pin::permissions;
use ykey_ctap::{
    preferred_protocol, status, AssertionResponse, AttestationResponse, ClientPin,
    CredentialDescriptor, Ctap2Session, CtapBackend, GetAssertionRequest, MakeCredentialRequest,
    UserEntity,
};

const OPTION_CLIENT_PIN: &str = "clientPin";
const OPTION_USER_VERIFICATION: &str = "uv";
const OPTION_RESIDENT_KEY: &str = "rk";
const OPTION_USER_PRESENCE: &str = "up";

/// Attested credential data offset in authenticatorData: 32-byte rpIdHash,
/// 1 flag byte, 4-byte counter, 16-byte AAGUID
const CREDENTIAL_ID_LENGTH_OFFSET: usize = 53;

/// Chunk size for allow-list pre-flight when the authenticator does not
/// advertise maxCredentialCountInList
const DEFAULT_MAX_CREDENTIALS_IN_LIST: u64 = 8;

/// Failure of a WebAuthn operation, classified for the caller
///
/// Security-state conditions keep their own variants with the retry
/// counters intact; only codes with no client-level meaning fall through
/// to [`ClientError::Ctap`].
#[derive(Debug)]
pub enum ClientError {
    /// The request is invalid as posed
    BadRequest(String),
    /// The authenticator cannot satisfy the request
    Unsupported(String),
    /// The device already holds an excluded credential
    DeviceIneligible,
    /// No credential on the device matches the request
    NoCredentials,
    /// A PIN is configured and must accompany this request
    PinRequired,
    PinInvalid { retries: u8 },
    PinBlocked,
    UvInvalid { attempts_remaining: u8 },
    /// Built-in verification is blocked until a successful PIN entry
    UvBlocked,
    Timeout,
    /// Several discoverable credentials matched; the user picks one
    MultipleAssertions(MultipleAssertionsAvailable),
    /// An unclassified CTAP status byte
    Ctap(u8),
    Other(Error),
}

impl ClientError {
    fn from_ctap(code: u8) -> Self {
        match code {
            status::CREDENTIAL_EXCLUDED => ClientError::DeviceIneligible,
            status::NO_CREDENTIALS => ClientError::NoCredentials,
            status::PUAT_REQUIRED => ClientError::PinRequired,
            status::PIN_BLOCKED => ClientError::PinBlocked,
            status::UV_BLOCKED => ClientError::UvBlocked,
            status::USER_ACTION_TIMEOUT | status::ACTION_TIMEOUT | status::KEEPALIVE_CANCEL => {
                ClientError::Timeout
            }
            status::UNSUPPORTED_ALGORITHM => {
                ClientError::Unsupported("no supported algorithm".into())
            }
            status::UNSUPPORTED_OPTION | status::INVALID_OPTION => {
                ClientError::Unsupported("option not supported".into())
            }
            status::KEY_STORE_FULL => {
                ClientError::Unsupported("no space left for credentials".into())
            }
            other => ClientError::Ctap(other),
        }
    }
}

impl From<Error> for ClientError {
    fn from(error: Error) -> Self {
        match error {
            Error::Ctap(code) => ClientError::from_ctap(code),
            Error::Timeout => ClientError::Timeout,
            other => ClientError::Other(other),
        }
    }
}

impl fmt::Display for ClientError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientError::BadRequest(message) => write!(f, "bad request: {message}"),
            ClientError::Unsupported(message) => write!(f, "not supported: {message}"),
            ClientError::DeviceIneligible => {
                write!(f, "the device is not eligible for this request")
            }
            ClientError::NoCredentials => write!(f, "no matching credential on the device"),
            ClientError::PinRequired => write!(f, "a PIN is required"),
            ClientError::PinInvalid { retries } => {
                write!(f, "wrong PIN, {retries} attempts remaining")
            }
            ClientError::PinBlocked => write!(f, "the PIN is blocked"),
            ClientError::UvInvalid { attempts_remaining } => {
                write!(f, "user verification failed, {attempts_remaining} attempts remaining")
            }
            ClientError::UvBlocked => write!(f, "user verification is blocked, use the PIN"),
            ClientError::Timeout => write!(f, "the operation timed out"),
            ClientError::MultipleAssertions(available) => {
                write!(f, "{} assertions available, a selection is needed", available.assertion_count())
            }
            ClientError::Ctap(code) => write!(f, "CTAP error {code:#04x}"),
            ClientError::Other(error) => error.fmt(f),
        }
    }
}

impl std::error::Error for ClientError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ClientError::Other(error) => Some(error),
            _ => None,
        }
    }
}

/// The request matched several discoverable credentials
///
/// All assertions were already collected; picking one needs no further
/// device traffic. [`select`](Self::select) consumes the set, so the
/// choice is final.
#[derive(Debug)]
pub struct MultipleAssertionsAvailable {
    client_data_json: Vec<u8>,
    assertions: Vec<AssertionResponse>,
}

impl MultipleAssertionsAvailable {
    pub fn assertion_count(&self) -> usize {
        self.assertions.len()
    }

    /// The user behind each assertion, in selection order
    ///
    /// `None` when the authenticator withheld user information, which it
    /// does for requests made without PIN/UV authorization.
    pub fn users(&self) -> Option<Vec<&UserEntity>> {
        self.assertions
            .iter()
            .map(|assertion| assertion.user.as_ref())
            .collect()
    }

    /// Resolve to the assertion at `index`, as ordered by [`users`](Self::users)
    pub fn select(mut self, index: usize) -> Result<AuthenticatorAssertionResponse, ClientError> {
        if index >= self.assertions.len() {
            return Err(ClientError::BadRequest(format!(
                "assertion index {index} out of range"
            )));
        }
        let assertion = self.assertions.swap_remove(index);
        let credential = assertion.credential.ok_or_else(|| {
            ClientError::Other(Error::bad_response("assertion carries no credential"))
        })?;
        Ok(AuthenticatorAssertionResponse {
            credential_id: credential.id,
            client_data_json: self.client_data_json,
            authenticator_data: assertion.auth_data,
            signature: assertion.signature,
            user_handle: assertion.user.map(|user| user.id),
        })
    }
}

/// A WebAuthn client backed by one CTAP2 authenticator
///
/// Capabilities are read once at construction. PIN and UV state changes
/// observed during operations, like a blocked verification method, update
/// the client so later calls take the right path.
pub struct WebAuthnClient<B: CtapBackend> {
    ctap: Ctap2Session<B>,
    pin_supported: bool,
    pin_configured: bool,
    uv_supported: bool,
    uv_configured: bool,
    uv_blocked: bool,
}

impl<B: CtapBackend> WebAuthnClient<B> {
    pub fn new(ctap: Ctap2Session<B>) -> Self {
        let info = ctap.info();
        let pin = info.get_option(OPTION_CLIENT_PIN);
        let uv = info.get_option(OPTION_USER_VERIFICATION);
        Self {
            pin_supported: pin.is_some(),
            pin_configured: pin == Some(true),
            uv_supported: uv.is_some(),
            uv_configured: uv == Some(true),
            uv_blocked: false,
            ctap,
        }
    }

    /// The underlying CTAP2 session
    pub fn ctap(&mut self) -> &mut Ctap2Session<B> {
        &mut self.ctap
    }

    pub fn pin_supported(&self) -> bool {
        self.pin_supported
    }

    pub fn pin_configured(&self) -> bool {
        self.pin_configured
    }

    pub fn uv_supported(&self) -> bool {
        self.uv_supported
    }

    pub fn uv_configured(&self) -> bool {
        self.uv_configured
    }

    /// Whether built-in verification has been blocked this session; once
    /// set, operations fall back to the PIN
    pub fn uv_blocked(&self) -> bool {
        self.uv_blocked
    }

    /// Register a new credential
    ///
    /// A PIN is required whenever one is configured and built-in user
    /// verification does not cover the request.
    pub fn make_credential(
        &mut self,
        client_data: &ClientData,
        options: &CreationOptions,
        effective_domain: &str,
        pin: Option<&str>,
        state: Option<&CommandState>,
    ) -> Result<AuthenticatorAttestationResponse, ClientError> {
        validate_rp_id(&options.rp.id, effective_domain)?;
        if options.extensions.is_some() {
            return Err(ClientError::Unsupported("extensions not supported".into()));
        }
        debug!("registering a credential for RP {}", options.rp.id);

        let selection = options.authenticator_selection.clone().unwrap_or_default();
        let mut ctap_options = BTreeMap::new();
        let resident_key = match selection.resident_key {
            Some(ResidentKeyRequirement::Required) => true,
            Some(ResidentKeyRequirement::Preferred) => self.uv_supported,
            _ => false,
        };
        if resident_key {
            ctap_options.insert(OPTION_RESIDENT_KEY.to_string(), true);
        }
        if self.ctap_uv(selection.user_verification, pin.is_some())? {
            ctap_options.insert(OPTION_USER_VERIFICATION.to_string(), true);
        }

        let mut token = None;
        if let Some(pin) = pin {
            token = Some(self.pin_token(
                pin,
                permissions::MAKE_CREDENTIAL | permissions::GET_ASSERTION,
                &options.rp.id,
            )?);
        } else if self.pin_configured && !ctap_options.contains_key(OPTION_USER_VERIFICATION) {
            // A configured PIN always gates credential creation
            return Err(ClientError::PinRequired);
        }

        let client_data_hash = client_data.hash();
        let (pin_uv_auth_param, pin_uv_auth_protocol) = match &token {
            Some(token) => {
                let protocol = preferred_protocol(self.ctap.info());
                let param = authenticate_with(protocol.as_ref(), token, &client_data_hash)?;
                (Some(param), Some(protocol.version()))
            }
            None => (None, None),
        };

        // Pre-flight narrows the exclude list to the one credential the
        // device holds, if any; the device then reports the exclusion
        // while still collecting user presence
        let exclude_list = if options.exclude_credentials.is_empty() {
            Vec::new()
        } else {
            let filter_token = token.as_ref().map(|token| token.as_slice());
            self.filter_creds(&options.rp.id, &options.exclude_credentials, filter_token, state)?
                .map(|descriptor| vec![descriptor])
                .unwrap_or_default()
        };

        let request = MakeCredentialRequest {
            client_data_hash: client_data_hash.to_vec(),
            rp: options.rp.clone(),
            user: options.user.clone(),
            pub_key_cred_params: options.pub_key_cred_params.clone(),
            exclude_list,
            extensions: None,
            options: (!ctap_options.is_empty()).then_some(ctap_options),
            pin_uv_auth_param,
            pin_uv_auth_protocol,
        };
        let credential = match self.ctap.make_credential(&request, state) {
            Ok(credential) => credential,
            Err(error) => return Err(self.classify_auth(error)),
        };

        Ok(AuthenticatorAttestationResponse {
            credential_id: credential_id_from_auth_data(&credential.auth_data)?,
            client_data_json: client_data.json().to_vec(),
            attestation_object: encode_attestation_object(&credential)?,
        })
    }

    /// Assert an existing credential
    ///
    /// With an empty allow list the discoverable credentials for the RP are
    /// used, and more than one match surfaces as
    /// [`ClientError::MultipleAssertions`].
    pub fn get_assertion(
        &mut self,
        client_data: &ClientData,
        options: &RequestOptions,
        effective_domain: &str,
        pin: Option<&str>,
        state: Option<&CommandState>,
    ) -> Result<AuthenticatorAssertionResponse, ClientError> {
        let rp_id = match &options.rp_id {
            Some(rp_id) => {
                validate_rp_id(rp_id, effective_domain)?;
                rp_id.clone()
            }
            None => effective_domain.to_string(),
        };
        if options.extensions.is_some() {
            return Err(ClientError::Unsupported("extensions not supported".into()));
        }
        debug!("requesting an assertion for RP {rp_id}");

        let mut ctap_options = BTreeMap::new();
        if self.ctap_uv(options.user_verification, pin.is_some())? {
            ctap_options.insert(OPTION_USER_VERIFICATION.to_string(), true);
        }

        let mut token = None;
        if let Some(pin) = pin {
            token = Some(self.pin_token(pin, permissions::GET_ASSERTION, &rp_id)?);
        }
        let client_data_hash = client_data.hash();
        let (pin_uv_auth_param, pin_uv_auth_protocol) = match &token {
            Some(token) => {
                let protocol = preferred_protocol(self.ctap.info());
                let param = authenticate_with(protocol.as_ref(), token, &client_data_hash)?;
                (Some(param), Some(protocol.version()))
            }
            None => (None, None),
        };

        let allow_list = if options.allow_credentials.is_empty() {
            Vec::new()
        } else {
            let filter_token = token.as_ref().map(|token| token.as_slice());
            match self.filter_creds(&rp_id, &options.allow_credentials, filter_token, state)? {
                Some(descriptor) => vec![descriptor],
                None => return Err(ClientError::NoCredentials),
            }
        };

        let request = GetAssertionRequest {
            rp_id,
            client_data_hash: client_data_hash.to_vec(),
            allow_list,
            extensions: None,
            options: (!ctap_options.is_empty()).then_some(ctap_options),
            pin_uv_auth_param,
            pin_uv_auth_protocol,
        };
        let assertions = match self.ctap.get_assertions(&request, state) {
            Ok(assertions) => assertions,
            Err(error) => return Err(self.classify_auth(error)),
        };

        if assertions.len() > 1 {
            return Err(ClientError::MultipleAssertions(MultipleAssertionsAvailable {
                client_data_json: client_data.json().to_vec(),
                assertions,
            }));
        }
        let assertion = assertions
            .into_iter()
            .next()
            .ok_or_else(|| ClientError::Other(Error::bad_response("empty assertion list")))?;

        let credential_id = match assertion.credential {
            Some(credential) => credential.id,
            // The device may omit the credential when the allow list
            // pinned it to a single entry
            None => request
                .allow_list
                .into_iter()
                .next()
                .map(|descriptor| descriptor.id)
                .ok_or_else(|| {
                    ClientError::Other(Error::bad_response("assertion carries no credential"))
                })?,
        };
        Ok(AuthenticatorAssertionResponse {
            credential_id,
            client_data_json: client_data.json().to_vec(),
            authenticator_data: assertion.auth_data,
            signature: assertion.signature,
            user_handle: assertion.user.map(|user| user.id),
        })
    }

    /// Set the PIN on an authenticator that supports one but has none
    pub fn set_pin(&mut self, pin: &str) -> Result<(), ClientError> {
        if !self.pin_supported {
            return Err(ClientError::BadRequest(
                "a PIN is not supported on this device".into(),
            ));
        }
        if self.pin_configured {
            return Err(ClientError::BadRequest(
                "a PIN is already configured on this device".into(),
            ));
        }
        let result = ClientPin::for_session(&mut self.ctap).set_pin(pin);
        result.map_err(|error| self.classify_auth(error))?;
        self.pin_configured = true;
        Ok(())
    }

    /// Change an existing PIN
    pub fn change_pin(&mut self, current_pin: &str, new_pin: &str) -> Result<(), ClientError> {
        if !self.pin_configured {
            return Err(ClientError::BadRequest(
                "no PIN is currently configured on this device".into(),
            ));
        }
        let result = ClientPin::for_session(&mut self.ctap).change_pin(current_pin, new_pin);
        result.map_err(|error| self.classify_auth(error))
    }

    /// The CTAP "uv" option for this request, from the W3C requirement and
    /// what the authenticator offers
    fn ctap_uv(
        &self,
        requirement: UserVerificationRequirement,
        pin_provided: bool,
    ) -> Result<bool, ClientError> {
        if pin_provided {
            if !self.pin_configured {
                return Err(ClientError::BadRequest(
                    "a PIN was provided but none is configured".into(),
                ));
            }
            // The PIN satisfies user verification on its own
            return Ok(false);
        }
        let pin_uv_supported = self.pin_supported || self.uv_supported;
        if requirement == UserVerificationRequirement::Discouraged
            || (requirement == UserVerificationRequirement::Preferred && !pin_uv_supported)
        {
            return Ok(false);
        }
        if self.uv_configured && !self.uv_blocked {
            return Ok(true);
        }
        if self.pin_configured {
            return Err(ClientError::PinRequired);
        }
        if pin_uv_supported {
            return Err(ClientError::BadRequest(
                "user verification is not configured".into(),
            ));
        }
        Err(ClientError::Unsupported(
            "user verification is not supported".into(),
        ))
    }

    /// Exchange the PIN for a pinUvAuthToken scoped to `permissions`
    fn pin_token(
        &mut self,
        pin: &str,
        permissions: u8,
        rp_id: &str,
    ) -> Result<Zeroizing<Vec<u8>>, ClientError> {
        let result = ClientPin::for_session(&mut self.ctap).get_pin_token(
            pin,
            Some(permissions),
            Some(rp_id),
        );
        result.map_err(|error| self.classify_auth(error))
    }

    /// Find the first listed credential the device actually holds
    ///
    /// Oversized credential IDs never leave the client. The rest are probed
    /// in chunks no larger than the advertised list capacity, with user
    /// presence suppressed, and the first chunk containing a match settles
    /// the result.
    fn filter_creds(
        &mut self,
        rp_id: &str,
        descriptors: &[CredentialDescriptor],
        token: Option<&[u8]>,
        state: Option<&CommandState>,
    ) -> Result<Option<CredentialDescriptor>, ClientError> {
        let info = self.ctap.info();
        let max_id_length = info.max_credential_id_length;
        let chunk_size = info
            .max_credential_count_in_list
            .unwrap_or(DEFAULT_MAX_CREDENTIALS_IN_LIST)
            .max(1) as usize;

        let eligible: Vec<CredentialDescriptor> = descriptors
            .iter()
            .filter(|descriptor| match max_id_length {
                Some(max) => descriptor.id.len() as u64 <= max,
                None => true,
            })
            .cloned()
            .collect();
        debug!(
            "pre-flighting {} credentials in chunks of {chunk_size}",
            eligible.len()
        );

        // Pre-flight requests sign a zero hash; they only ask "which of
        // these do you hold"
        let client_data_hash = [0u8; 32];
        let (pin_uv_auth_param, pin_uv_auth_protocol) = match token {
            Some(token) => {
                let protocol = preferred_protocol(self.ctap.info());
                let param = authenticate_with(protocol.as_ref(), token, &client_data_hash)?;
                (Some(param), Some(protocol.version()))
            }
            None => (None, None),
        };
        let mut options = BTreeMap::new();
        options.insert(OPTION_USER_PRESENCE.to_string(), false);

        for chunk in eligible.chunks(chunk_size) {
            let request = GetAssertionRequest {
                rp_id: rp_id.to_string(),
                client_data_hash: client_data_hash.to_vec(),
                allow_list: chunk.to_vec(),
                extensions: None,
                options: Some(options.clone()),
                pin_uv_auth_param: pin_uv_auth_param.clone(),
                pin_uv_auth_protocol,
            };
            match self.ctap.get_assertions(&request, state) {
                Ok(assertions) => {
                    if chunk.len() == 1 {
                        return Ok(Some(chunk[0].clone()));
                    }
                    let returned = assertions
                        .first()
                        .and_then(|assertion| assertion.credential.as_ref());
                    if let Some(credential) = returned {
                        if let Some(descriptor) =
                            chunk.iter().find(|descriptor| descriptor.id == credential.id)
                        {
                            return Ok(Some(descriptor.clone()));
                        }
                    }
                }
                Err(Error::Ctap(code)) if code == status::NO_CREDENTIALS => {}
                Err(error) => return Err(self.classify_auth(error)),
            }
        }
        Ok(None)
    }

    /// Classify a CTAP-layer failure, folding in the retry counters the
    /// next prompt needs
    fn classify_auth(&mut self, error: Error) -> ClientError {
        match error {
            Error::Ctap(code) if code == status::PIN_INVALID => {
                match ClientPin::for_session(&mut self.ctap).get_pin_retries() {
                    Ok((retries, _)) => ClientError::PinInvalid { retries },
                    Err(fetch_error) => ClientError::from(fetch_error),
                }
            }
            Error::Ctap(code) if code == status::UV_INVALID => {
                match ClientPin::for_session(&mut self.ctap).get_uv_retries() {
                    Ok(attempts_remaining) => ClientError::UvInvalid { attempts_remaining },
                    Err(fetch_error) => ClientError::from(fetch_error),
                }
            }
            Error::Ctap(code) if code == status::UV_BLOCKED || code == status::PUAT_REQUIRED => {
                // The device will not take built-in verification again
                // until a PIN succeeds; remember that for later calls
                self.uv_blocked = true;
                ClientError::from_ctap(code)
            }
            other => ClientError::from(other),
        }
    }
}

/// An RP ID must equal the effective domain or be a suffix of it at a
/// label boundary
fn validate_rp_id(rp_id: &str, effective_domain: &str) -> Result<(), ClientError> {
    if effective_domain == rp_id || effective_domain.ends_with(&format!(".{rp_id}")) {
        Ok(())
    } else {
        Err(ClientError::BadRequest(
            "RP ID is not valid for the effective domain".into(),
        ))
    }
}

fn authenticate_with(
    protocol: &dyn PinUvAuthProtocol,
    token: &[u8],
    message: &[u8],
) -> Result<Vec<u8>, ClientError> {
    protocol
        .authenticate(token, message)
        .map_err(|_| ClientError::Other(Error::bad_response("pinUvAuthParam computation failed")))
}

/// Credential ID from the attested credential data in authenticatorData
fn credential_id_from_auth_data(auth_data: &[u8]) -> Result<Vec<u8>, ClientError> {
    let length_end = CREDENTIAL_ID_LENGTH_OFFSET + 2;
    let length = auth_data
        .get(CREDENTIAL_ID_LENGTH_OFFSET..length_end)
        .map(|bytes| u16::from_be_bytes([bytes[0], bytes[1]]) as usize)
        .ok_or_else(|| ClientError::Other(Error::bad_response("authenticator data too short")))?;
    auth_data
        .get(length_end..length_end + length)
        .map(<[u8]>::to_vec)
        .ok_or_else(|| ClientError::Other(Error::bad_response("credential ID out of bounds")))
}

/// WebAuthn attestation object: the CTAP response re-keyed with the
/// WebAuthn member names, in canonical order
fn encode_attestation_object(credential: &AttestationResponse) -> Result<Vec<u8>, ClientError> {
    let map = Value::Map(vec![
        (
            Value::Text("fmt".into()),
            Value::Text(credential.format.clone()),
        ),
        (Value::Text("attStmt".into()), credential.att_stmt.clone()),
        (
            Value::Text("authData".into()),
            Value::Bytes(credential.auth_data.clone()),
        ),
    ]);
    cbor::encode(&map).map_err(ClientError::Other)
}

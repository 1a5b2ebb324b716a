//! authenticatorConfig
//!
//! Administrative toggles gated on the `authnrCfg` info option. Each call
//! carries a pinUvAuthParam over `32 * 0xFF ‖ 0x0D ‖ subcommand ‖ params`
//! when a token is held; authenticators without a PIN configured accept the
//! commands bare.

use zeroize::Zeroizing;

use ykey_core::error::{Error, Result};
use ykey_crypto::PinUvAuthProtocol;

use crate::cbor::{self, MapBuilder, Value};
use crate::ctap2::{Ctap2Session, CtapBackend, CMD_CONFIG};

const SUB_ENABLE_ENTERPRISE_ATTESTATION: u8 = 0x01;
const SUB_TOGGLE_ALWAYS_UV: u8 = 0x02;
const SUB_SET_MIN_PIN_LENGTH: u8 = 0x03;

const ARG_SUB_COMMAND: i32 = 0x01;
const ARG_SUB_COMMAND_PARAMS: i32 = 0x02;
const ARG_PIN_UV_PROTOCOL: i32 = 0x03;
const ARG_PIN_UV_PARAM: i32 = 0x04;

const PARAM_NEW_MIN_PIN_LENGTH: i32 = 0x01;
const PARAM_MIN_PIN_LENGTH_RP_IDS: i32 = 0x02;
const PARAM_FORCE_CHANGE_PIN: i32 = 0x03;

/// Client side of authenticatorConfig
pub struct Config<'a, B: CtapBackend> {
    session: &'a mut Ctap2Session<B>,
    auth: Option<(Box<dyn PinUvAuthProtocol>, Zeroizing<Vec<u8>>)>,
}

impl<'a, B: CtapBackend> Config<'a, B> {
    pub fn new(session: &'a mut Ctap2Session<B>) -> Result<Self> {
        Self::build(session, None)
    }

    /// Authenticate each call with a token holding the acfg permission
    pub fn with_token(
        session: &'a mut Ctap2Session<B>,
        protocol: Box<dyn PinUvAuthProtocol>,
        token: Zeroizing<Vec<u8>>,
    ) -> Result<Self> {
        Self::build(session, Some((protocol, token)))
    }

    fn build(
        session: &'a mut Ctap2Session<B>,
        auth: Option<(Box<dyn PinUvAuthProtocol>, Zeroizing<Vec<u8>>)>,
    ) -> Result<Self> {
        if session.info().get_option("authnrCfg") != Some(true) {
            return Err(Error::NotSupported(
                "authenticator does not support authenticatorConfig".into(),
            ));
        }
        Ok(Self { session, auth })
    }

    pub fn enable_enterprise_attestation(&mut self) -> Result<()> {
        self.call(SUB_ENABLE_ENTERPRISE_ATTESTATION, None)
    }

    pub fn toggle_always_uv(&mut self) -> Result<()> {
        self.call(SUB_TOGGLE_ALWAYS_UV, None)
    }

    /// Raise the minimum PIN length, scope it to relying parties, or force
    /// a PIN change on next use
    pub fn set_min_pin_length(
        &mut self,
        min_pin_length: Option<u64>,
        rp_ids: Option<&[String]>,
        force_change_pin: Option<bool>,
    ) -> Result<()> {
        let params = MapBuilder::new()
            .insert_opt(PARAM_NEW_MIN_PIN_LENGTH, min_pin_length)?
            .insert_opt(PARAM_MIN_PIN_LENGTH_RP_IDS, rp_ids)?
            .insert_opt(PARAM_FORCE_CHANGE_PIN, force_change_pin)?
            .build_value()?;
        self.call(SUB_SET_MIN_PIN_LENGTH, Some(params))
    }

    fn call(&mut self, subcommand: u8, params: Option<Value>) -> Result<()> {
        let mut builder = MapBuilder::new()
            .insert(ARG_SUB_COMMAND, subcommand)?
            .insert_opt(ARG_SUB_COMMAND_PARAMS, params.as_ref())?;
        if let Some((protocol, token)) = &self.auth {
            let mut message = vec![0xFF; 32];
            message.push(0x0D);
            message.push(subcommand);
            if let Some(params) = &params {
                message.extend_from_slice(&cbor::encode(params)?);
            }
            let auth = protocol
                .authenticate(token, &message)
                .map_err(|_| Error::bad_response("pinUvAuthParam computation failed"))?;
            builder = builder
                .insert(ARG_PIN_UV_PROTOCOL, protocol.version())?
                .insert_bytes(ARG_PIN_UV_PARAM, &auth)?;
        }
        let args = builder.build()?;
        self.session.send_cbor(CMD_CONFIG, Some(&args), None)?;
        Ok(())
    }
}

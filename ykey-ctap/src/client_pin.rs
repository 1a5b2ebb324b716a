//! authenticatorClientPIN
//!
//! PIN/UV auth token flows on top of a `Ctap2Session`: ECDH key agreement,
//! PIN set/change, and token acquisition. Authenticators that advertise the
//! `pinUvAuthToken` option get the CTAP 2.1 permission subcommands; older
//! ones fall back to the legacy getPinToken flow.

use sha2::{Digest, Sha256};
use zeroize::Zeroizing;

use ykey_core::error::{Error, Result};
use ykey_core::state::CommandState;
use ykey_crypto::{PinProtocolOne, PinProtocolTwo, PinUvAuthProtocol};

use crate::cbor::{MapBuilder, MapParser, Value};
use crate::ctap2::{Ctap2Session, CtapBackend, CMD_CLIENT_PIN};
use crate::status;
use crate::types::InfoData;

const CMD_GET_PIN_RETRIES: u8 = 0x01;
const CMD_GET_KEY_AGREEMENT: u8 = 0x02;
const CMD_SET_PIN: u8 = 0x03;
const CMD_CHANGE_PIN: u8 = 0x04;
const CMD_GET_PIN_TOKEN: u8 = 0x05;
const CMD_GET_TOKEN_USING_UV: u8 = 0x06;
const CMD_GET_UV_RETRIES: u8 = 0x07;
const CMD_GET_TOKEN_USING_PIN: u8 = 0x09;

const ARG_PIN_UV_PROTOCOL: i32 = 0x01;
const ARG_SUB_COMMAND: i32 = 0x02;
const ARG_KEY_AGREEMENT: i32 = 0x03;
const ARG_PIN_UV_PARAM: i32 = 0x04;
const ARG_NEW_PIN_ENC: i32 = 0x05;
const ARG_PIN_HASH_ENC: i32 = 0x06;
const ARG_PERMISSIONS: i32 = 0x09;
const ARG_RP_ID: i32 = 0x0A;

const RESULT_KEY_AGREEMENT: i32 = 0x01;
const RESULT_PIN_UV_TOKEN: i32 = 0x02;
const RESULT_PIN_RETRIES: i32 = 0x03;
const RESULT_POWER_CYCLE_STATE: i32 = 0x04;
const RESULT_UV_RETRIES: i32 = 0x05;

// COSE_Key labels for the P-256 key agreement keys
const COSE_KTY: i32 = 1;
const COSE_ALG: i32 = 3;
const COSE_CRV: i32 = -1;
const COSE_X: i32 = -2;
const COSE_Y: i32 = -3;

const KTY_EC2: i64 = 2;
const ALG_ECDH_ES_HKDF_256: i64 = -25;
const CRV_P256: i64 = 1;

const MIN_PIN_CODE_POINTS: usize = 4;
const MAX_PIN_BYTES: usize = 63;
const PIN_BUFFER_LEN: usize = 64;
const PIN_HASH_LEN: usize = 16;

/// pinUvAuthToken permission flags
pub mod permissions {
    pub const MAKE_CREDENTIAL: u8 = 0x01;
    pub const GET_ASSERTION: u8 = 0x02;
    pub const CREDENTIAL_MANAGEMENT: u8 = 0x04;
    pub const BIO_ENROLLMENT: u8 = 0x08;
    pub const LARGE_BLOB_WRITE: u8 = 0x10;
    pub const AUTHENTICATOR_CONFIGURATION: u8 = 0x20;
}

/// Protocol Two when the authenticator offers it, else One
pub fn preferred_protocol(info: &InfoData) -> Box<dyn PinUvAuthProtocol> {
    if info.pin_uv_auth_protocols.contains(&2) {
        Box::new(PinProtocolTwo)
    } else {
        Box::new(PinProtocolOne)
    }
}

/// Client side of authenticatorClientPIN
pub struct ClientPin<'a, B: CtapBackend> {
    session: &'a mut Ctap2Session<B>,
    protocol: Box<dyn PinUvAuthProtocol>,
}

impl<'a, B: CtapBackend> ClientPin<'a, B> {
    pub fn new(
        session: &'a mut Ctap2Session<B>,
        protocol: Box<dyn PinUvAuthProtocol>,
    ) -> Self {
        Self { session, protocol }
    }

    /// Construct with the strongest protocol the authenticator lists
    pub fn for_session(session: &'a mut Ctap2Session<B>) -> Self {
        let protocol = preferred_protocol(session.info());
        Self::new(session, protocol)
    }

    pub fn protocol_version(&self) -> u64 {
        self.protocol.version()
    }

    /// Remaining PIN attempts and, when reported, whether a power cycle is
    /// needed before the next attempt
    pub fn get_pin_retries(&mut self) -> Result<(u8, Option<bool>)> {
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_GET_PIN_RETRIES)?
            .build()?;
        let response = self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        let map = MapParser::from_bytes(&response)?;
        Ok((
            map.get(RESULT_PIN_RETRIES)?,
            map.get_opt(RESULT_POWER_CYCLE_STATE)?,
        ))
    }

    /// Remaining built-in user verification attempts
    pub fn get_uv_retries(&mut self) -> Result<u8> {
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_GET_UV_RETRIES)?
            .build()?;
        let response = self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        MapParser::from_bytes(&response)?.get(RESULT_UV_RETRIES)
    }

    /// Set the PIN on an authenticator that has none
    pub fn set_pin(&mut self, pin: &str) -> Result<()> {
        let padded = prepare_pin(pin)?;
        let (platform_key, secret) = self.key_agreement()?;
        let new_pin_enc = self
            .protocol
            .encrypt(&secret, padded.as_ref())
            .map_err(|_| Error::bad_response("PIN encryption failed"))?;
        let auth = self
            .protocol
            .authenticate(&secret, &new_pin_enc)
            .map_err(|_| Error::bad_response("pinUvAuthParam computation failed"))?;
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_SET_PIN)?
            .insert(ARG_KEY_AGREEMENT, &platform_key)?
            .insert_bytes(ARG_PIN_UV_PARAM, &auth)?
            .insert_bytes(ARG_NEW_PIN_ENC, &new_pin_enc)?
            .build()?;
        self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        Ok(())
    }

    /// Change an existing PIN
    pub fn change_pin(&mut self, current_pin: &str, new_pin: &str) -> Result<()> {
        let padded = prepare_pin(new_pin)?;
        let (platform_key, secret) = self.key_agreement()?;
        let pin_hash = hash_pin(current_pin);
        let pin_hash_enc = self
            .protocol
            .encrypt(&secret, &pin_hash)
            .map_err(|_| Error::bad_response("PIN hash encryption failed"))?;
        let new_pin_enc = self
            .protocol
            .encrypt(&secret, padded.as_ref())
            .map_err(|_| Error::bad_response("PIN encryption failed"))?;
        // pinUvAuthParam covers newPinEnc followed by pinHashEnc
        let mut message = new_pin_enc.clone();
        message.extend_from_slice(&pin_hash_enc);
        let auth = self
            .protocol
            .authenticate(&secret, &message)
            .map_err(|_| Error::bad_response("pinUvAuthParam computation failed"))?;
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_CHANGE_PIN)?
            .insert(ARG_KEY_AGREEMENT, &platform_key)?
            .insert_bytes(ARG_PIN_UV_PARAM, &auth)?
            .insert_bytes(ARG_NEW_PIN_ENC, &new_pin_enc)?
            .insert_bytes(ARG_PIN_HASH_ENC, &pin_hash_enc)?
            .build()?;
        self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        Ok(())
    }

    /// Exchange the PIN for a pinUvAuthToken
    ///
    /// Uses getPinUvAuthTokenUsingPinWithPermissions when the authenticator
    /// supports it and `permissions` is given; otherwise the legacy
    /// getPinToken subcommand, which grants the implicit MC and GA scope.
    pub fn get_pin_token(
        &mut self,
        pin: &str,
        permissions: Option<u8>,
        rp_id: Option<&str>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        let (platform_key, secret) = self.key_agreement()?;
        let pin_hash = hash_pin(pin);
        let pin_hash_enc = self
            .protocol
            .encrypt(&secret, &pin_hash)
            .map_err(|_| Error::bad_response("PIN hash encryption failed"))?;

        let with_permissions = permissions.is_some() && self.supports_permissions();
        let subcommand = if with_permissions {
            CMD_GET_TOKEN_USING_PIN
        } else {
            CMD_GET_PIN_TOKEN
        };
        let mut builder = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, subcommand)?
            .insert(ARG_KEY_AGREEMENT, &platform_key)?
            .insert_bytes(ARG_PIN_HASH_ENC, &pin_hash_enc)?;
        if with_permissions {
            builder = builder
                .insert_opt(ARG_PERMISSIONS, permissions)?
                .insert_opt(ARG_RP_ID, rp_id)?;
        }
        let args = builder.build()?;
        let response = self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        self.decrypt_token(&secret, &response)
    }

    /// Obtain a pinUvAuthToken through built-in user verification
    ///
    /// `UV_BLOCKED` and `UV_INVALID` come back verbatim so callers can fall
    /// back to the PIN flow.
    pub fn get_uv_token(
        &mut self,
        permissions: u8,
        rp_id: Option<&str>,
        state: Option<&CommandState>,
    ) -> Result<Zeroizing<Vec<u8>>> {
        if !self.supports_permissions() {
            return Err(Error::NotSupported(
                "authenticator does not support pinUvAuthToken".into(),
            ));
        }
        let (platform_key, secret) = self.key_agreement()?;
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_GET_TOKEN_USING_UV)?
            .insert(ARG_KEY_AGREEMENT, &platform_key)?
            .insert(ARG_PERMISSIONS, permissions)?
            .insert_opt(ARG_RP_ID, rp_id)?
            .build()?;
        let response = self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), state)?;
        self.decrypt_token(&secret, &response)
    }

    fn supports_permissions(&self) -> bool {
        self.session.info().get_option("pinUvAuthToken") == Some(true)
    }

    /// Fetch the authenticator's key agreement key and run ECDH against it
    fn key_agreement(&mut self) -> Result<(Value, Zeroizing<Vec<u8>>)> {
        let args = MapBuilder::new()
            .insert(ARG_PIN_UV_PROTOCOL, self.protocol.version())?
            .insert(ARG_SUB_COMMAND, CMD_GET_KEY_AGREEMENT)?
            .build()?;
        let response = self.session.send_cbor(CMD_CLIENT_PIN, Some(&args), None)?;
        let peer: Value = MapParser::from_bytes(&response)?.get(RESULT_KEY_AGREEMENT)?;
        let peer = MapParser::from_value(&peer)?;
        let peer_x = coordinate(peer.get_bytes(COSE_X)?)?;
        let peer_y = coordinate(peer.get_bytes(COSE_Y)?)?;

        let ((x, y), secret) = self
            .protocol
            .encapsulate(&peer_x, &peer_y)
            .map_err(|_| Error::bad_response("key agreement failed"))?;
        let platform_key = MapBuilder::new()
            .insert(COSE_KTY, KTY_EC2)?
            .insert(COSE_ALG, ALG_ECDH_ES_HKDF_256)?
            .insert(COSE_CRV, CRV_P256)?
            .insert_bytes(COSE_X, &x)?
            .insert_bytes(COSE_Y, &y)?
            .build_value()?;
        Ok((platform_key, secret))
    }

    fn decrypt_token(&self, secret: &[u8], response: &[u8]) -> Result<Zeroizing<Vec<u8>>> {
        let token_enc = MapParser::from_bytes(response)?.get_bytes(RESULT_PIN_UV_TOKEN)?;
        self.protocol
            .decrypt(secret, &token_enc)
            .map(Zeroizing::new)
            .map_err(|_| Error::bad_response("pinUvAuthToken decryption failed"))
    }
}

fn coordinate(bytes: Vec<u8>) -> Result<[u8; 32]> {
    bytes
        .try_into()
        .map_err(|_| Error::bad_response("bad keyAgreement coordinate"))
}

fn hash_pin(pin: &str) -> Zeroizing<Vec<u8>> {
    Zeroizing::new(Sha256::digest(pin.as_bytes())[..PIN_HASH_LEN].to_vec())
}

/// Enforce the CTAP PIN rules and pad to the fixed encryption buffer
fn prepare_pin(pin: &str) -> Result<Zeroizing<[u8; PIN_BUFFER_LEN]>> {
    if pin.chars().count() < MIN_PIN_CODE_POINTS || pin.len() > MAX_PIN_BYTES {
        return Err(Error::Ctap(status::PIN_POLICY_VIOLATION));
    }
    let mut padded = Zeroizing::new([0u8; PIN_BUFFER_LEN]);
    padded[..pin.len()].copy_from_slice(pin.as_bytes());
    Ok(padded)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use ykey_crypto::ecdh::KeyPair;

    use super::*;
    use crate::ctap2::CMD_GET_INFO;

    /// Device side of the ClientPIN exchange, sharing the real protocol
    /// crypto so tokens round-trip for real
    struct MockAuthenticator {
        device_key: KeyPair,
        protocol: Box<dyn PinUvAuthProtocol>,
        supports_token: bool,
        expected_pin: String,
        token: Vec<u8>,
        subcommands: Vec<u8>,
    }

    impl MockAuthenticator {
        fn new(protocol: Box<dyn PinUvAuthProtocol>, supports_token: bool) -> Self {
            Self {
                device_key: KeyPair::generate(),
                protocol,
                supports_token,
                expected_pin: "123456".into(),
                token: vec![0x5A; 32],
                subcommands: Vec::new(),
            }
        }

        fn info_response(&self) -> Vec<u8> {
            let mut options = BTreeMap::new();
            options.insert("clientPin".to_string(), true);
            if self.supports_token {
                options.insert("pinUvAuthToken".to_string(), true);
                options.insert("uv".to_string(), true);
            }
            let mut out = vec![status::OK];
            out.extend_from_slice(
                &MapBuilder::new()
                    .insert(0x01, vec!["FIDO_2_1".to_string()])
                    .unwrap()
                    .insert_bytes(0x03, &[0u8; 16])
                    .unwrap()
                    .insert(0x04, options)
                    .unwrap()
                    .insert(0x06, vec![self.protocol.version()])
                    .unwrap()
                    .build()
                    .unwrap(),
            );
            out
        }

        fn shared_secret(&self, args: &MapParser) -> Zeroizing<Vec<u8>> {
            let platform: Value = args.get(ARG_KEY_AGREEMENT).unwrap();
            let platform = MapParser::from_value(&platform).unwrap();
            let x: [u8; 32] = platform.get_bytes(COSE_X).unwrap().try_into().unwrap();
            let y: [u8; 32] = platform.get_bytes(COSE_Y).unwrap().try_into().unwrap();
            let z = self
                .device_key
                .shared_secret_from_coordinates(&x, &y)
                .unwrap();
            self.protocol.kdf(&z)
        }
    }

    fn ok_map(builder: MapBuilder) -> Result<Vec<u8>> {
        let mut out = vec![status::OK];
        out.extend_from_slice(&builder.build().unwrap());
        Ok(out)
    }

    impl CtapBackend for MockAuthenticator {
        fn transact(
            &mut self,
            command: u8,
            payload: &[u8],
            _state: Option<&CommandState>,
        ) -> Result<Vec<u8>> {
            if command == CMD_GET_INFO {
                return Ok(self.info_response());
            }
            assert_eq!(command, CMD_CLIENT_PIN);
            let args = MapParser::from_bytes(payload).unwrap();
            assert_eq!(
                args.get::<u64>(ARG_PIN_UV_PROTOCOL).unwrap(),
                self.protocol.version()
            );
            let subcommand: u8 = args.get(ARG_SUB_COMMAND).unwrap();
            self.subcommands.push(subcommand);
            match subcommand {
                CMD_GET_PIN_RETRIES => ok_map(
                    MapBuilder::new()
                        .insert(RESULT_PIN_RETRIES, 5u8)
                        .unwrap()
                        .insert(RESULT_POWER_CYCLE_STATE, false)
                        .unwrap(),
                ),
                CMD_GET_UV_RETRIES => {
                    ok_map(MapBuilder::new().insert(RESULT_UV_RETRIES, 3u8).unwrap())
                }
                CMD_GET_KEY_AGREEMENT => {
                    let (x, y) = self.device_key.public_key_coordinates();
                    let key = MapBuilder::new()
                        .insert(COSE_KTY, KTY_EC2)
                        .unwrap()
                        .insert(COSE_ALG, ALG_ECDH_ES_HKDF_256)
                        .unwrap()
                        .insert(COSE_CRV, CRV_P256)
                        .unwrap()
                        .insert_bytes(COSE_X, &x)
                        .unwrap()
                        .insert_bytes(COSE_Y, &y)
                        .unwrap()
                        .build_value()
                        .unwrap();
                    ok_map(MapBuilder::new().insert(RESULT_KEY_AGREEMENT, &key).unwrap())
                }
                CMD_GET_PIN_TOKEN | CMD_GET_TOKEN_USING_PIN => {
                    if subcommand == CMD_GET_PIN_TOKEN {
                        assert!(!args.contains_key(ARG_PERMISSIONS));
                        assert!(!args.contains_key(ARG_RP_ID));
                    } else {
                        assert!(args.contains_key(ARG_PERMISSIONS));
                    }
                    let secret = self.shared_secret(&args);
                    let pin_hash_enc = args.get_bytes(ARG_PIN_HASH_ENC).unwrap();
                    let pin_hash = self.protocol.decrypt(&secret, &pin_hash_enc).unwrap();
                    let expected = Sha256::digest(self.expected_pin.as_bytes());
                    assert_eq!(pin_hash, expected[..PIN_HASH_LEN].to_vec());
                    let token_enc = self.protocol.encrypt(&secret, &self.token).unwrap();
                    ok_map(
                        MapBuilder::new()
                            .insert_bytes(RESULT_PIN_UV_TOKEN, &token_enc)
                            .unwrap(),
                    )
                }
                CMD_GET_TOKEN_USING_UV => {
                    let secret = self.shared_secret(&args);
                    assert!(args.contains_key(ARG_PERMISSIONS));
                    let token_enc = self.protocol.encrypt(&secret, &self.token).unwrap();
                    ok_map(
                        MapBuilder::new()
                            .insert_bytes(RESULT_PIN_UV_TOKEN, &token_enc)
                            .unwrap(),
                    )
                }
                CMD_SET_PIN => {
                    let secret = self.shared_secret(&args);
                    let new_pin_enc = args.get_bytes(ARG_NEW_PIN_ENC).unwrap();
                    let auth = args.get_bytes(ARG_PIN_UV_PARAM).unwrap();
                    assert_eq!(
                        auth,
                        self.protocol.authenticate(&secret, &new_pin_enc).unwrap()
                    );
                    let padded = self.protocol.decrypt(&secret, &new_pin_enc).unwrap();
                    assert_eq!(padded.len(), PIN_BUFFER_LEN);
                    let pin = self.expected_pin.as_bytes();
                    assert_eq!(&padded[..pin.len()], pin);
                    assert!(padded[pin.len()..].iter().all(|&b| b == 0));
                    Ok(vec![status::OK])
                }
                CMD_CHANGE_PIN => {
                    let secret = self.shared_secret(&args);
                    let new_pin_enc = args.get_bytes(ARG_NEW_PIN_ENC).unwrap();
                    let pin_hash_enc = args.get_bytes(ARG_PIN_HASH_ENC).unwrap();
                    let auth = args.get_bytes(ARG_PIN_UV_PARAM).unwrap();
                    let mut message = new_pin_enc.clone();
                    message.extend_from_slice(&pin_hash_enc);
                    assert_eq!(auth, self.protocol.authenticate(&secret, &message).unwrap());
                    let pin_hash = self.protocol.decrypt(&secret, &pin_hash_enc).unwrap();
                    let expected = Sha256::digest(self.expected_pin.as_bytes());
                    assert_eq!(pin_hash, expected[..PIN_HASH_LEN].to_vec());
                    Ok(vec![status::OK])
                }
                other => panic!("unexpected subcommand {other:#04x}"),
            }
        }
    }

    fn info_with_protocols(protocols: Vec<u64>) -> InfoData {
        let mut out = MapBuilder::new()
            .insert(0x01, vec!["FIDO_2_1".to_string()])
            .unwrap()
            .insert_bytes(0x03, &[0u8; 16])
            .unwrap();
        if !protocols.is_empty() {
            out = out.insert(0x06, protocols).unwrap();
        }
        InfoData::from_cbor(&out.build().unwrap()).unwrap()
    }

    #[test]
    fn test_preferred_protocol() {
        assert_eq!(preferred_protocol(&info_with_protocols(vec![1])).version(), 1);
        assert_eq!(
            preferred_protocol(&info_with_protocols(vec![2, 1])).version(),
            2
        );
        assert_eq!(
            preferred_protocol(&info_with_protocols(vec![1, 2])).version(),
            2
        );
        assert_eq!(preferred_protocol(&info_with_protocols(vec![])).version(), 1);
    }

    #[test]
    fn test_get_pin_retries() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        assert_eq!(client_pin.get_pin_retries().unwrap(), (5, Some(false)));
    }

    #[test]
    fn test_get_uv_retries() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        assert_eq!(client_pin.get_uv_retries().unwrap(), 3);
    }

    #[test]
    fn test_pin_token_with_permissions() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolTwo), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        assert_eq!(client_pin.protocol_version(), 2);
        let token = client_pin
            .get_pin_token(
                "123456",
                Some(permissions::MAKE_CREDENTIAL | permissions::GET_ASSERTION),
                Some("example.com"),
            )
            .unwrap();
        assert_eq!(&token[..], &[0x5A; 32]);
        assert_eq!(
            session.backend().subcommands,
            vec![CMD_GET_KEY_AGREEMENT, CMD_GET_TOKEN_USING_PIN]
        );
    }

    #[test]
    fn test_pin_token_legacy_fallback() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), false);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        let token = client_pin
            .get_pin_token("123456", Some(permissions::GET_ASSERTION), None)
            .unwrap();
        assert_eq!(&token[..], &[0x5A; 32]);
        assert_eq!(
            session.backend().subcommands,
            vec![CMD_GET_KEY_AGREEMENT, CMD_GET_PIN_TOKEN]
        );
    }

    #[test]
    fn test_uv_token() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolTwo), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        let token = client_pin
            .get_uv_token(permissions::GET_ASSERTION, Some("example.com"), None)
            .unwrap();
        assert_eq!(&token[..], &[0x5A; 32]);
    }

    #[test]
    fn test_uv_token_requires_token_option() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), false);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        assert!(matches!(
            client_pin.get_uv_token(permissions::GET_ASSERTION, None, None),
            Err(Error::NotSupported(_))
        ));
        // Gate trips before any ClientPIN bytes go out
        assert!(session.backend().subcommands.is_empty());
    }

    #[test]
    fn test_set_pin() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        client_pin.set_pin("123456").unwrap();
        assert_eq!(
            session.backend().subcommands,
            vec![CMD_GET_KEY_AGREEMENT, CMD_SET_PIN]
        );
    }

    #[test]
    fn test_change_pin() {
        let mut backend = MockAuthenticator::new(Box::new(PinProtocolTwo), true);
        backend.expected_pin = "123456".into();
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        client_pin.change_pin("123456", "better secret").unwrap();
        assert_eq!(
            session.backend().subcommands,
            vec![CMD_GET_KEY_AGREEMENT, CMD_CHANGE_PIN]
        );
    }

    #[test]
    fn test_pin_length_rules() {
        let backend = MockAuthenticator::new(Box::new(PinProtocolOne), true);
        let mut session = Ctap2Session::new(backend).unwrap();
        let mut client_pin = ClientPin::for_session(&mut session);
        assert_eq!(
            client_pin.set_pin("abc").unwrap_err(),
            Error::Ctap(status::PIN_POLICY_VIOLATION)
        );
        let too_long = "x".repeat(64);
        assert_eq!(
            client_pin.set_pin(&too_long).unwrap_err(),
            Error::Ctap(status::PIN_POLICY_VIOLATION)
        );
        // Four multi-byte code points stay within the byte limit
        client_pin.change_pin("123456", "çäöü").unwrap();
        assert!(session.backend().subcommands.contains(&CMD_CHANGE_PIN));
    }
}

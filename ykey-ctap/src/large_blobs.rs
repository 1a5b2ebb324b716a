//! authenticatorLargeBlobs
//!
//! The serialized large-blob array is a CBOR array of sealed entries with a
//! trailing 16-byte SHA-256 checksum, moved in fragments of at most
//! maxMsgSize - 64 bytes. A checksum or parse failure reads as an empty
//! array so a damaged store heals on the next write instead of wedging.

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::debug;
use zeroize::Zeroizing;

use ykey_core::error::{Error, Result};
use ykey_crypto::{blob, PinUvAuthProtocol};

use crate::cbor::{self, MapBuilder, MapParser, Value};
use crate::ctap2::{Ctap2Session, CtapBackend, CMD_LARGE_BLOBS};

const ARG_GET: i32 = 0x01;
const ARG_SET: i32 = 0x02;
const ARG_OFFSET: i32 = 0x03;
const ARG_LENGTH: i32 = 0x04;
const ARG_PIN_UV_PARAM: i32 = 0x05;
const ARG_PIN_UV_PROTOCOL: i32 = 0x06;

const RESULT_CONFIG: i32 = 0x01;

const ENTRY_CIPHERTEXT: i32 = 0x01;
const ENTRY_NONCE: i32 = 0x02;
const ENTRY_ORIG_SIZE: i32 = 0x03;

const CHECKSUM_LEN: usize = 16;
const FRAGMENT_OVERHEAD: usize = 64;

/// One sealed entry of the large-blob array
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobEntry {
    pub ciphertext: Vec<u8>,
    pub nonce: [u8; blob::BLOB_NONCE_SIZE],
    pub orig_size: u64,
}

impl BlobEntry {
    /// Entries something else wrote may be shaped differently; those are
    /// skipped, not errors
    fn from_value(value: &Value) -> Option<Self> {
        let map = MapParser::from_value(value).ok()?;
        let nonce: [u8; blob::BLOB_NONCE_SIZE] = map.get_bytes(ENTRY_NONCE).ok()?.try_into().ok()?;
        Some(Self {
            ciphertext: map.get_bytes(ENTRY_CIPHERTEXT).ok()?,
            nonce,
            orig_size: map.get(ENTRY_ORIG_SIZE).ok()?,
        })
    }

    fn to_value(&self) -> Result<Value> {
        MapBuilder::new()
            .insert_bytes(ENTRY_CIPHERTEXT, &self.ciphertext)?
            .insert_bytes(ENTRY_NONCE, &self.nonce)?
            .insert(ENTRY_ORIG_SIZE, self.orig_size)?
            .build_value()
    }

    /// Decrypt and inflate when `key` fits this entry
    fn open(&self, key: &[u8; blob::BLOB_KEY_SIZE]) -> Option<Vec<u8>> {
        let compressed = blob::open(key, &self.nonce, &self.ciphertext, self.orig_size).ok()?;
        blob::decompress(&compressed, self.orig_size).ok()
    }
}

/// Client side of authenticatorLargeBlobs
///
/// Writes need a pinUvAuthToken with the largeBlobWrite permission once a
/// PIN or UV is configured; construct via [`with_token`](Self::with_token)
/// for that case.
pub struct LargeBlobs<'a, B: CtapBackend> {
    session: &'a mut Ctap2Session<B>,
    max_fragment_len: usize,
    auth: Option<(Box<dyn PinUvAuthProtocol>, Zeroizing<Vec<u8>>)>,
}

impl<'a, B: CtapBackend> LargeBlobs<'a, B> {
    pub fn new(session: &'a mut Ctap2Session<B>) -> Result<Self> {
        Self::build(session, None)
    }

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
        if session.info().get_option("largeBlobs") != Some(true) {
            return Err(Error::NotSupported(
                "authenticator does not support largeBlobs".into(),
            ));
        }
        let max_fragment_len = session.info().max_msg_size as usize - FRAGMENT_OVERHEAD;
        Ok(Self {
            session,
            max_fragment_len,
            auth,
        })
    }

    /// Read and verify the whole array
    pub fn read_blob_array(&mut self) -> Result<Vec<BlobEntry>> {
        let mut buffer = Vec::new();
        loop {
            let args = MapBuilder::new()
                .insert(ARG_GET, self.max_fragment_len as u64)?
                .insert(ARG_OFFSET, buffer.len() as u64)?
                .build()?;
            let response = self.session.send_cbor(CMD_LARGE_BLOBS, Some(&args), None)?;
            let fragment = MapParser::from_bytes(&response)?.get_bytes(RESULT_CONFIG)?;
            let done = fragment.len() < self.max_fragment_len;
            buffer.extend_from_slice(&fragment);
            if done {
                break;
            }
        }
        Ok(parse_blob_array(&buffer))
    }

    /// Serialize, checksum, and write the whole array in fragments
    pub fn write_blob_array(&mut self, entries: &[BlobEntry]) -> Result<()> {
        let values = entries
            .iter()
            .map(BlobEntry::to_value)
            .collect::<Result<Vec<_>>>()?;
        let mut serialized = cbor::encode(&values)?;
        let checksum = Sha256::digest(&serialized);
        serialized.extend_from_slice(&checksum[..CHECKSUM_LEN]);

        let total = serialized.len();
        let mut offset = 0;
        while offset < total {
            let end = usize::min(offset + self.max_fragment_len, total);
            let fragment = &serialized[offset..end];
            let mut builder = MapBuilder::new()
                .insert_bytes(ARG_SET, fragment)?
                .insert(ARG_OFFSET, offset as u64)?;
            // The total length goes out with the first fragment only
            if offset == 0 {
                builder = builder.insert(ARG_LENGTH, total as u64)?;
            }
            if let Some((protocol, token)) = &self.auth {
                let auth = protocol
                    .authenticate(token, &auth_message(offset as u32, fragment))
                    .map_err(|_| Error::bad_response("pinUvAuthParam computation failed"))?;
                builder = builder
                    .insert_bytes(ARG_PIN_UV_PARAM, &auth)?
                    .insert(ARG_PIN_UV_PROTOCOL, protocol.version())?;
            }
            let args = builder.build()?;
            self.session.send_cbor(CMD_LARGE_BLOBS, Some(&args), None)?;
            offset = end;
        }
        Ok(())
    }

    /// The first stored blob `large_blob_key` opens, inflated
    pub fn get_blob(&mut self, large_blob_key: &[u8; blob::BLOB_KEY_SIZE]) -> Result<Option<Vec<u8>>> {
        let entries = self.read_blob_array()?;
        Ok(entries.iter().find_map(|entry| entry.open(large_blob_key)))
    }

    /// Store `data` under `large_blob_key`, replacing whatever the key
    /// opened before; `None` removes without replacement
    pub fn put_blob(
        &mut self,
        large_blob_key: &[u8; blob::BLOB_KEY_SIZE],
        data: Option<&[u8]>,
    ) -> Result<()> {
        let mut entries = self.read_blob_array()?;
        let kept = entries.len();
        entries.retain(|entry| entry.open(large_blob_key).is_none());
        let mut changed = entries.len() != kept;

        if let Some(data) = data {
            let orig_size = data.len() as u64;
            let compressed =
                blob::compress(data).map_err(|_| Error::bad_response("blob compression failed"))?;
            let mut nonce = [0u8; blob::BLOB_NONCE_SIZE];
            rand::thread_rng().fill(&mut nonce);
            let ciphertext = blob::seal(large_blob_key, &nonce, &compressed, orig_size)
                .map_err(|_| Error::bad_response("blob sealing failed"))?;
            entries.push(BlobEntry {
                ciphertext,
                nonce,
                orig_size,
            });
            changed = true;
        }

        if changed {
            self.write_blob_array(&entries)?;
        }
        Ok(())
    }

    pub fn delete_blob(&mut self, large_blob_key: &[u8; blob::BLOB_KEY_SIZE]) -> Result<()> {
        self.put_blob(large_blob_key, None)
    }
}

fn parse_blob_array(data: &[u8]) -> Vec<BlobEntry> {
    if data.len() < CHECKSUM_LEN {
        return Vec::new();
    }
    let (body, checksum) = data.split_at(data.len() - CHECKSUM_LEN);
    if Sha256::digest(body)[..CHECKSUM_LEN] != *checksum {
        debug!("large-blob checksum mismatch, reading as empty");
        return Vec::new();
    }
    let values: Vec<Value> = match cbor::decode(body) {
        Ok(values) => values,
        Err(_) => return Vec::new(),
    };
    values.iter().filter_map(BlobEntry::from_value).collect()
}

fn auth_message(offset: u32, fragment: &[u8]) -> Vec<u8> {
    let mut message = vec![0xFF; 32];
    message.push(0x0C);
    message.push(0x00);
    message.extend_from_slice(&offset.to_le_bytes());
    message.extend_from_slice(&Sha256::digest(fragment));
    message
}

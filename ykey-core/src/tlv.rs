//! BER-TLV encoding and decoding
//!
//! Used by the PIV, OpenPGP and Management applications. Tags are one byte,
//! or two bytes when the low five bits of the first byte are all set
//! (e.g. `0x7F49`). Lengths use the definite short or long form.

use std::collections::BTreeMap;

use crate::error::{Error, Result};

/// A single tag-length-value item
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tlv {
    tag: u16,
    value: Vec<u8>,
}

impl Tlv {
    /// Create a new TLV from a tag and its value bytes
    pub fn new(tag: u16, value: impl Into<Vec<u8>>) -> Self {
        Self {
            tag,
            value: value.into(),
        }
    }

    pub fn tag(&self) -> u16 {
        self.tag
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn into_value(self) -> Vec<u8> {
        self.value
    }

    /// Encode to bytes, choosing the minimal length form
    pub fn to_bytes(&self) -> Vec<u8> {
        let len = self.value.len();
        let mut out = Vec::with_capacity(2 + 3 + len);
        if self.tag > 0xFF {
            out.push((self.tag >> 8) as u8);
        }
        out.push(self.tag as u8);
        if len < 0x80 {
            out.push(len as u8);
        } else if len <= 0xFF {
            out.push(0x81);
            out.push(len as u8);
        } else if len <= 0xFFFF {
            out.push(0x82);
            out.extend_from_slice(&(len as u16).to_be_bytes());
        } else {
            out.push(0x83);
            out.push((len >> 16) as u8);
            out.push((len >> 8) as u8);
            out.push(len as u8);
        }
        out.extend_from_slice(&self.value);
        out
    }

    /// Parse one TLV from the start of `data`, returning it together with
    /// the number of bytes consumed
    pub fn parse_from(data: &[u8]) -> Result<(Tlv, usize)> {
        let mut pos = 0;
        let first = *data.first().ok_or_else(|| Error::bad_response("empty TLV"))?;
        pos += 1;
        let tag = if first & 0x1F == 0x1F {
            let second = *data
                .get(pos)
                .ok_or_else(|| Error::bad_response("truncated TLV tag"))?;
            pos += 1;
            (first as u16) << 8 | second as u16
        } else {
            first as u16
        };

        let length_byte = *data
            .get(pos)
            .ok_or_else(|| Error::bad_response("missing TLV length"))?;
        pos += 1;
        let length = if length_byte < 0x80 {
            length_byte as usize
        } else {
            let num_bytes = (length_byte & 0x7F) as usize;
            if num_bytes == 0 || num_bytes > 4 {
                return Err(Error::bad_response("unsupported TLV length form"));
            }
            let mut length = 0usize;
            for _ in 0..num_bytes {
                let byte = *data
                    .get(pos)
                    .ok_or_else(|| Error::bad_response("truncated TLV length"))?;
                pos += 1;
                length = length << 8 | byte as usize;
            }
            length
        };

        if data.len() - pos < length {
            return Err(Error::bad_response(format!(
                "TLV length {} exceeds remaining {} bytes",
                length,
                data.len() - pos
            )));
        }
        let value = data[pos..pos + length].to_vec();
        Ok((Tlv { tag, value }, pos + length))
    }

    /// Parse a single TLV from `data`, ignoring any trailing bytes
    pub fn parse(data: &[u8]) -> Result<Tlv> {
        Ok(Self::parse_from(data)?.0)
    }
}

/// Decode a sequence of TLVs covering all of `data`
pub fn parse_list(data: &[u8]) -> Result<Vec<Tlv>> {
    let mut tlvs = Vec::new();
    let mut remaining = data;
    while !remaining.is_empty() {
        let (tlv, consumed) = Tlv::parse_from(remaining)?;
        tlvs.push(tlv);
        remaining = &remaining[consumed..];
    }
    Ok(tlvs)
}

/// Decode a sequence of TLVs into a tag-keyed map
///
/// Duplicate tags overwrite earlier occurrences, matching how device
/// responses are interpreted.
pub fn parse_map(data: &[u8]) -> Result<BTreeMap<u16, Vec<u8>>> {
    let mut map = BTreeMap::new();
    for tlv in parse_list(data)? {
        map.insert(tlv.tag, tlv.value);
    }
    Ok(map)
}

/// Encode a sequence of TLVs
pub fn pack_list(tlvs: &[Tlv]) -> Vec<u8> {
    let mut out = Vec::new();
    for tlv in tlvs {
        out.extend_from_slice(&tlv.to_bytes());
    }
    out
}

/// Encode ordered `(tag, value)` pairs as a TLV sequence
pub fn pack_map(entries: &[(u16, Vec<u8>)]) -> Vec<u8> {
    let mut out = Vec::new();
    for (tag, value) in entries {
        out.extend_from_slice(&Tlv::new(*tag, value.clone()).to_bytes());
    }
    out
}

/// Parse a single TLV and return its value, requiring the expected tag
pub fn unpack_value(expected_tag: u16, data: &[u8]) -> Result<Vec<u8>> {
    let tlv = Tlv::parse(data)?;
    if tlv.tag != expected_tag {
        return Err(Error::bad_response(format!(
            "expected tag 0x{:02X}, got 0x{:02X}",
            expected_tag, tlv.tag
        )));
    }
    Ok(tlv.value)
}

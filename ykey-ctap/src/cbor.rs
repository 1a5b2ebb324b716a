//! CBOR encoding and decoding for the CTAP2 protocol
//!
//! CTAP2 requires canonically-encoded maps: keys sorted by their encoded
//! representation, which puts positive integer keys before negative ones.
//! [`MapBuilder`] produces canonical integer-keyed maps for request
//! arguments and COSE keys; [`MapParser`] reads response maps while
//! tolerating keys this SDK does not know about.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use ykey_core::error::{Error, Result};

/// CBOR value type used for free-form structures
pub type Value = cbor4ii::core::Value;

/// Encode a serializable value to CBOR bytes
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    cbor4ii::serde::to_vec(Vec::new(), value)
        .map_err(|_| Error::bad_response("CBOR encoding failed"))
}

/// Decode CBOR bytes to a value
pub fn decode<T: for<'de> Deserialize<'de>>(data: &[u8]) -> Result<T> {
    cbor4ii::serde::from_slice(data).map_err(|_| Error::bad_response("invalid CBOR"))
}

/// Integer key ordered by its CBOR encoding
///
/// Positive integers encode with major type 0 and negative with major type
/// 1, so all positive keys sort before all negative keys, and negative keys
/// sort by absolute value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CborOrderedKey(i32);

impl PartialOrd for CborOrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for CborOrderedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        use std::cmp::Ordering;
        match (self.0 >= 0, other.0 >= 0) {
            (true, true) => self.0.cmp(&other.0),
            (false, false) => other.0.cmp(&self.0),
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
        }
    }
}

fn write_integer_key(out: &mut Vec<u8>, key: i32) {
    let (major, value) = if key >= 0 {
        (0x00u8, key as u32)
    } else {
        (0x20u8, (-key - 1) as u32)
    };
    if value <= 23 {
        out.push(major | value as u8);
    } else if value <= 0xFF {
        out.push(major | 0x18);
        out.push(value as u8);
    } else if value <= 0xFFFF {
        out.push(major | 0x19);
        out.extend_from_slice(&(value as u16).to_be_bytes());
    } else {
        out.push(major | 0x1A);
        out.extend_from_slice(&value.to_be_bytes());
    }
}

/// Build a canonical CBOR map with integer keys
pub struct MapBuilder {
    entries: Vec<(i32, Vec<u8>)>,
}

impl MapBuilder {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Insert a key and serializable value
    pub fn insert<T: Serialize>(mut self, key: i32, value: T) -> Result<Self> {
        let encoded = encode(&value)?;
        self.entries.push((key, encoded));
        Ok(self)
    }

    /// Insert only when the value is present
    pub fn insert_opt<T: Serialize>(self, key: i32, value: Option<T>) -> Result<Self> {
        match value {
            Some(value) => self.insert(key, value),
            None => Ok(self),
        }
    }

    /// Insert a CBOR byte string
    pub fn insert_bytes(self, key: i32, bytes: &[u8]) -> Result<Self> {
        self.insert(key, serde_bytes::Bytes::new(bytes))
    }

    /// Insert a byte string only when present
    pub fn insert_bytes_opt(self, key: i32, bytes: Option<&[u8]>) -> Result<Self> {
        match bytes {
            Some(bytes) => self.insert_bytes(key, bytes),
            None => Ok(self),
        }
    }

    /// Encode the map with keys in canonical order
    pub fn build(self) -> Result<Vec<u8>> {
        let mut map: BTreeMap<CborOrderedKey, Vec<u8>> = BTreeMap::new();
        for (key, value) in self.entries {
            map.insert(CborOrderedKey(key), value);
        }

        let mut out = Vec::new();
        if map.len() <= 23 {
            out.push(0xA0 | map.len() as u8);
        } else if map.len() <= 0xFF {
            out.push(0xB8);
            out.push(map.len() as u8);
        } else {
            return Err(Error::bad_response("CBOR map too large"));
        }
        for (key, value) in map {
            write_integer_key(&mut out, key.0);
            out.extend_from_slice(&value);
        }
        Ok(out)
    }

    /// Encode and reparse as a [`Value`] for nesting inside other structures
    pub fn build_value(self) -> Result<Value> {
        decode(&self.build()?)
    }
}

impl Default for MapBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Read an integer-keyed CBOR map, ignoring unknown keys
pub struct MapParser {
    map: BTreeMap<i32, Vec<u8>>,
}

impl MapParser {
    pub fn from_bytes(data: &[u8]) -> Result<Self> {
        let raw: BTreeMap<i32, Value> = decode(data)?;
        let mut map = BTreeMap::new();
        for (key, value) in raw {
            map.insert(key, encode(&value)?);
        }
        Ok(Self { map })
    }

    pub fn from_value(value: &Value) -> Result<Self> {
        Self::from_bytes(&encode(value)?)
    }

    /// Get a required value
    pub fn get<T: for<'de> Deserialize<'de>>(&self, key: i32) -> Result<T> {
        let bytes = self
            .map
            .get(&key)
            .ok_or_else(|| Error::bad_response(format!("missing CBOR key {}", key)))?;
        decode(bytes)
    }

    /// Get an optional value
    pub fn get_opt<T: for<'de> Deserialize<'de>>(&self, key: i32) -> Result<Option<T>> {
        match self.map.get(&key) {
            Some(bytes) => Ok(Some(decode(bytes)?)),
            None => Ok(None),
        }
    }

    /// Get a required byte string
    pub fn get_bytes(&self, key: i32) -> Result<Vec<u8>> {
        let buf: serde_bytes::ByteBuf = self.get(key)?;
        Ok(buf.into_vec())
    }

    /// Get an optional byte string
    pub fn get_bytes_opt(&self, key: i32) -> Result<Option<Vec<u8>>> {
        match self.get_opt::<serde_bytes::ByteBuf>(key)? {
            Some(buf) => Ok(Some(buf.into_vec())),
            None => Ok(None),
        }
    }

    pub fn contains_key(&self, key: i32) -> bool {
        self.map.contains_key(&key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_through_map() {
        let cbor = MapBuilder::new()
            .insert(1, "test")
            .unwrap()
            .insert(2, 42u64)
            .unwrap()
            .insert_bytes(3, &[1, 2, 3])
            .unwrap()
            .build()
            .unwrap();

        let parser = MapParser::from_bytes(&cbor).unwrap();
        assert_eq!(parser.get::<String>(1).unwrap(), "test");
        assert_eq!(parser.get::<u64>(2).unwrap(), 42);
        assert_eq!(parser.get_bytes(3).unwrap(), vec![1, 2, 3]);
        assert!(!parser.contains_key(4));
        assert!(parser.get::<u64>(9).is_err());
        assert_eq!(parser.get_opt::<u64>(9).unwrap(), None);
    }

    #[test]
    fn test_optional_insertion() {
        let cbor = MapBuilder::new()
            .insert_opt(1, Some(1u8))
            .unwrap()
            .insert_opt::<u8>(2, None)
            .unwrap()
            .insert_bytes_opt(3, None)
            .unwrap()
            .build()
            .unwrap();
        let parser = MapParser::from_bytes(&cbor).unwrap();
        assert!(parser.contains_key(1));
        assert!(!parser.contains_key(2));
        assert!(!parser.contains_key(3));
    }

    #[test]
    fn test_canonical_key_order() {
        // COSE_Key layout: positive keys ascending, then negative by encoding
        let cbor = MapBuilder::new()
            .insert(-2, "x")
            .unwrap()
            .insert(3, -25i64)
            .unwrap()
            .insert(-1, 1u8)
            .unwrap()
            .insert(1, 2u8)
            .unwrap()
            .insert(-3, "y")
            .unwrap()
            .build()
            .unwrap();

        assert_eq!(cbor[0], 0xA5);
        // 1: 2
        assert_eq!(&cbor[1..3], &[0x01, 0x02]);
        // 3: -25 (0x38 0x18)
        assert_eq!(&cbor[3..6], &[0x03, 0x38, 0x18]);
        // -1 (0x20), then -2 (0x21), then -3 (0x22)
        assert_eq!(cbor[6], 0x20);
        assert_eq!(cbor[8], 0x21);
        assert_eq!(&cbor[9..11], &[0x61, b'x']);
        assert_eq!(cbor[11], 0x22);
    }

    #[test]
    fn test_large_keys_encode_with_prefix() {
        let mut out = Vec::new();
        write_integer_key(&mut out, 24);
        assert_eq!(out, vec![0x18, 24]);
        out.clear();
        write_integer_key(&mut out, 300);
        assert_eq!(out, vec![0x19, 0x01, 0x2C]);
        out.clear();
        write_integer_key(&mut out, -25);
        assert_eq!(out, vec![0x38, 24]);
    }

    #[test]
    fn test_invalid_cbor_rejected() {
        assert!(MapParser::from_bytes(&[0xFF, 0xFF]).is_err());
        assert!(decode::<String>(&[0x01]).is_err());
    }

    #[test]
    fn test_nested_value() {
        let inner = MapBuilder::new()
            .insert(1, "inner")
            .unwrap()
            .build_value()
            .unwrap();
        let cbor = MapBuilder::new()
            .insert(1, inner)
            .unwrap()
            .build()
            .unwrap();
        let parser = MapParser::from_bytes(&cbor).unwrap();
        let inner: Value = parser.get(1).unwrap();
        let inner = MapParser::from_value(&inner).unwrap();
        assert_eq!(inner.get::<String>(1).unwrap(), "inner");
    }
}

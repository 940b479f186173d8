use std::collections::BTreeMap;
use std::io::Write;

use byteorder::{LittleEndian, WriteBytesExt};

use crate::error::{DatabaseIntegrityError, VariantDictionaryError, Warning, Warnings};
use crate::io::{SliceReader, WriteLengthTaggedExt};

pub const VARIANT_DICTIONARY_VERSION: u16 = 0x100;
pub const VARIANT_DICTIONARY_END: u8 = 0x0;

pub const U32_TYPE_ID: u8 = 0x04;
pub const U64_TYPE_ID: u8 = 0x05;
pub const BOOL_TYPE_ID: u8 = 0x08;
pub const I32_TYPE_ID: u8 = 0x0c;
pub const I64_TYPE_ID: u8 = 0x0d;
pub const STR_TYPE_ID: u8 = 0x18;
pub const BYTES_TYPE_ID: u8 = 0x42;

/// Typed key-value container used by KDBX4 for KDF parameters and public
/// custom data.
///
/// Keys are kept in sorted order so that dumping a dictionary is
/// deterministic.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct VariantDictionary {
    pub data: BTreeMap<String, VariantDictionaryValue>,
}

impl VariantDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub(crate) fn parse(
        buffer: &[u8],
        warnings: &mut Warnings,
    ) -> Result<VariantDictionary, VariantDictionaryError> {
        let mut reader = SliceReader::new(buffer, "variant dictionary");

        let version = reader.read_u16().map_err(truncated)?;

        // only the major version (high byte) is checked; minor bumps are
        // compatible by definition
        if version & 0xff00 != VARIANT_DICTIONARY_VERSION {
            return Err(VariantDictionaryError::InvalidVersion { version });
        }

        let mut data = BTreeMap::new();

        loop {
            // a dictionary is only complete once the explicit terminator
            // record has been seen
            if reader.is_empty() {
                return Err(VariantDictionaryError::NotTerminated);
            }

            let value_type = reader.read_u8().map_err(truncated)?;
            if value_type == VARIANT_DICTIONARY_END {
                break;
            }

            let key = String::from_utf8_lossy(reader.read_with_len().map_err(truncated)?).to_string();
            let value_buffer = reader.read_with_len().map_err(truncated)?;

            let value = match value_type {
                U32_TYPE_ID => {
                    VariantDictionaryValue::UInt32(read_fixed(value_buffer, 4)? as u32)
                }
                U64_TYPE_ID => VariantDictionaryValue::UInt64(read_fixed(value_buffer, 8)?),
                BOOL_TYPE_ID => VariantDictionaryValue::Bool(value_buffer != [0]),
                I32_TYPE_ID => VariantDictionaryValue::Int32(read_fixed(value_buffer, 4)? as i32),
                I64_TYPE_ID => VariantDictionaryValue::Int64(read_fixed(value_buffer, 8)? as i64),
                STR_TYPE_ID => {
                    VariantDictionaryValue::String(String::from_utf8_lossy(value_buffer).to_string())
                }
                BYTES_TYPE_ID => VariantDictionaryValue::ByteArray(value_buffer.to_vec()),
                _ => {
                    // unknown types round-trip as raw bytes so that data
                    // written by newer clients survives a load/save cycle
                    warnings.push(Warning::UnknownVariantType {
                        key: key.clone(),
                        value_type,
                    });
                    VariantDictionaryValue::Opaque {
                        type_id: value_type,
                        value: value_buffer.to_vec(),
                    }
                }
            };

            data.insert(key, value);
        }

        Ok(VariantDictionary { data })
    }

    pub(crate) fn dump(&self, writer: &mut dyn Write) -> Result<(), std::io::Error> {
        writer.write_u16::<LittleEndian>(VARIANT_DICTIONARY_VERSION)?;

        for (field_name, field_value) in &self.data {
            match field_value {
                VariantDictionaryValue::UInt32(value) => {
                    writer.write_u8(U32_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_u32::<LittleEndian>(4)?;
                    writer.write_u32::<LittleEndian>(*value)?;
                }
                VariantDictionaryValue::UInt64(value) => {
                    writer.write_u8(U64_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_u32::<LittleEndian>(8)?;
                    writer.write_u64::<LittleEndian>(*value)?;
                }
                VariantDictionaryValue::Bool(value) => {
                    writer.write_u8(BOOL_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_u32::<LittleEndian>(1)?;
                    writer.write_u8(if *value { 1 } else { 0 })?;
                }
                VariantDictionaryValue::Int32(value) => {
                    writer.write_u8(I32_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_u32::<LittleEndian>(4)?;
                    writer.write_i32::<LittleEndian>(*value)?;
                }
                VariantDictionaryValue::Int64(value) => {
                    writer.write_u8(I64_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_u32::<LittleEndian>(8)?;
                    writer.write_i64::<LittleEndian>(*value)?;
                }
                VariantDictionaryValue::String(value) => {
                    writer.write_u8(STR_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_with_len(value.as_bytes())?;
                }
                VariantDictionaryValue::ByteArray(value) => {
                    writer.write_u8(BYTES_TYPE_ID)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_with_len(value)?;
                }
                VariantDictionaryValue::Opaque { type_id, value } => {
                    writer.write_u8(*type_id)?;
                    writer.write_with_len(field_name.as_bytes())?;
                    writer.write_with_len(value)?;
                }
            };
        }

        // signify end of variant dictionary
        writer.write_u8(VARIANT_DICTIONARY_END)?;
        Ok(())
    }

    pub fn get<'a, T: 'a>(&'a self, key: &str) -> Result<&'a T, VariantDictionaryError>
    where
        &'a VariantDictionaryValue: Into<Option<&'a T>>,
    {
        let vdv = self
            .data
            .get(key)
            .ok_or_else(|| VariantDictionaryError::MissingKey { key: key.to_owned() })?;

        vdv.into()
            .ok_or_else(|| VariantDictionaryError::Mistyped { key: key.to_owned() })
    }

    pub fn set<T>(&mut self, key: &str, value: T)
    where
        T: Into<VariantDictionaryValue>,
    {
        self.data.insert(key.to_string(), value.into());
    }
}

fn truncated(_: DatabaseIntegrityError) -> VariantDictionaryError {
    VariantDictionaryError::Truncated
}

fn read_fixed(buffer: &[u8], len: usize) -> Result<u64, VariantDictionaryError> {
    if buffer.len() != len {
        return Err(VariantDictionaryError::Truncated);
    }

    let mut out = 0u64;
    for (i, byte) in buffer.iter().enumerate() {
        out |= u64::from(*byte) << (8 * i);
    }
    Ok(out)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VariantDictionaryValue {
    UInt32(u32),
    UInt64(u64),
    Bool(bool),
    Int32(i32),
    Int64(i64),
    String(String),
    ByteArray(Vec<u8>),
    /// Value of a type this library does not understand, preserved verbatim
    Opaque { type_id: u8, value: Vec<u8> },
}

impl From<u32> for VariantDictionaryValue {
    fn from(v: u32) -> Self {
        VariantDictionaryValue::UInt32(v)
    }
}

impl From<u64> for VariantDictionaryValue {
    fn from(v: u64) -> Self {
        VariantDictionaryValue::UInt64(v)
    }
}

impl From<i32> for VariantDictionaryValue {
    fn from(v: i32) -> Self {
        VariantDictionaryValue::Int32(v)
    }
}

impl From<i64> for VariantDictionaryValue {
    fn from(v: i64) -> Self {
        VariantDictionaryValue::Int64(v)
    }
}

impl From<bool> for VariantDictionaryValue {
    fn from(v: bool) -> Self {
        VariantDictionaryValue::Bool(v)
    }
}

impl From<String> for VariantDictionaryValue {
    fn from(v: String) -> Self {
        VariantDictionaryValue::String(v)
    }
}

impl From<Vec<u8>> for VariantDictionaryValue {
    fn from(v: Vec<u8>) -> Self {
        VariantDictionaryValue::ByteArray(v)
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a u32> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::UInt32(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a u64> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::UInt64(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a bool> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::Bool(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a i32> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::Int32(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a i64> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::Int64(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a String> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::String(v) => Some(v),
            _ => None,
        }
    }
}

impl<'a> From<&'a VariantDictionaryValue> for Option<&'a Vec<u8>> {
    fn from(vdv: &'a VariantDictionaryValue) -> Self {
        match vdv {
            VariantDictionaryValue::ByteArray(v) => Some(v),
            _ => None,
        }
    }
}

#[cfg(test)]
mod variant_dictionary_tests {
    use hex_literal::hex;

    use super::*;

    fn parse(data: &[u8]) -> Result<VariantDictionary, VariantDictionaryError> {
        VariantDictionary::parse(data, &mut Warnings::new())
    }

    #[test]
    fn parsing_errors() -> Result<(), VariantDictionaryError> {
        let res = parse("not-a-variant-dictionary".as_bytes());
        assert!(matches!(res, Err(VariantDictionaryError::InvalidVersion { .. })));

        let res = parse(&hex!("0001"));
        assert!(matches!(res, Err(VariantDictionaryError::NotTerminated)));

        let res = parse(&hex!("000100"));
        assert!(matches!(res, Ok(_)));

        //                          ver t key_len key   val_len value   termination
        //                          |   | |       |     |       |       |
        let res = parse(&hex!("000104030000004142430400000015CD5B0700"))?;
        assert_eq!(res.get::<u32>("ABC")?, &123456789);

        Ok(())
    }

    #[test]
    fn unknown_value_type_is_preserved() -> Result<(), VariantDictionaryError> {
        //                      ver t  key_len key  val_len  value termination
        //                      |   |  |       |    |        |     |
        let data = hex!("0001AA 02000000 4142 02000000 BEEF 00");

        let mut warnings = Warnings::new();
        let vd = VariantDictionary::parse(&data, &mut warnings)?;

        assert_eq!(warnings.as_slice().len(), 1);
        assert_eq!(
            vd.data.get("AB"),
            Some(&VariantDictionaryValue::Opaque {
                type_id: 0xAA,
                value: vec![0xBE, 0xEF],
            })
        );

        // and it dumps back byte-for-byte
        let mut dumped = Vec::new();
        vd.dump(&mut dumped).unwrap();
        assert_eq!(&dumped[..], &data[..]);

        Ok(())
    }

    #[test]
    fn variant_dictionary_round_trip() {
        let mut vd = VariantDictionary::new();

        vd.set("a-u32", 42u32);
        vd.set("a-u64", 1337u64);
        vd.set("a-i32", -2i32);
        vd.set("a-i64", -31337i64);
        vd.set("a-bool", true);
        vd.set("a-string", "Testing".to_string());
        vd.set("a-bytes", "testing".as_bytes().to_vec());

        assert!(vd.get::<bool>("key-not-exist").is_err());

        assert!(vd.get::<u32>("a-string").is_err());
        assert!(vd.get::<u64>("a-string").is_err());
        assert!(vd.get::<i32>("a-string").is_err());
        assert!(vd.get::<i64>("a-string").is_err());
        assert!(vd.get::<bool>("a-string").is_err());
        assert!(vd.get::<String>("a-bytes").is_err());
        assert!(vd.get::<Vec<u8>>("a-string").is_err());

        assert_eq!(vd.get::<u32>("a-u32").unwrap(), &42u32);
        assert_eq!(vd.get::<u64>("a-u64").unwrap(), &1337u64);
        assert_eq!(vd.get::<i32>("a-i32").unwrap(), &-2i32);
        assert_eq!(vd.get::<i64>("a-i64").unwrap(), &-31337i64);
        assert_eq!(vd.get::<bool>("a-bool").unwrap(), &true);
        assert_eq!(vd.get::<String>("a-string").unwrap(), "Testing");
        assert_eq!(vd.get::<Vec<u8>>("a-bytes").unwrap(), "testing".as_bytes());

        let mut vd_data = Vec::new();
        vd.dump(&mut vd_data).unwrap();

        let vd_parsed = parse(&vd_data).unwrap();
        assert_eq!(vd_parsed, vd);
    }
}

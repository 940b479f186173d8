use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    config::{CompressionConfig, DatabaseConfig, KdfConfig, OuterCipherConfig, RawHeaderField},
    crypt::{self, kdf::Kdf},
    db::{Database, OpenOptions},
    error::{DatabaseIntegrityError, DatabaseKeyError, DatabaseOpenError, Warning, Warnings},
    format::{
        kdbx3::{
            Kdbx3OuterHeader, HEADER_COMMENT, HEADER_COMPRESSION_ID, HEADER_ENCRYPTION_IV,
            HEADER_END, HEADER_INNER_RANDOM_STREAM_ID, HEADER_MASTER_SEED,
            HEADER_PROTECTED_STREAM_KEY, HEADER_STREAM_START_BYTES, HEADER_TRANSFORM_ROUNDS,
            HEADER_TRANSFORM_SEED, HEADER_OUTER_ENCRYPTION_ID,
        },
        DatabaseVersion,
    },
    hash_block_stream,
    io::SliceReader,
    key::DatabaseKey,
};

/// Open, decrypt and parse a KDBX3 database from a source and key
pub(crate) fn parse_kdbx3(
    data: &[u8],
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<Database, DatabaseOpenError> {
    let (header, _header_bytes, xml) = decrypt_kdbx3(data, key, options, warnings)?;

    let mut inner_decryptor = header
        .inner_cipher_config
        .get_cipher(&header.protected_stream_key)?;

    let database_content = crate::xml_db::parse::parse(&xml, &mut *inner_decryptor)?;

    let config = DatabaseConfig {
        version: header.version,
        version_locked: false,
        outer_cipher_config: header.outer_cipher_config,
        compression_config: header.compression_config,
        inner_cipher_config: header.inner_cipher_config,
        kdf_config: KdfConfig::Aes {
            rounds: header.transform_rounds,
        },
        public_custom_data: Default::default(),
        unknown_header_fields: header.unknown_fields,
    };

    let mut db = Database::new(config);
    db.root = database_content.root.group;
    db.deleted_objects = database_content.root.deleted_objects;
    db.meta = database_content.meta;

    Ok(db)
}

/// Open and decrypt a KDBX3 database, returning the header, the raw header
/// bytes and the decrypted XML document
pub(crate) fn decrypt_kdbx3(
    data: &[u8],
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<(Kdbx3OuterHeader, Vec<u8>, Vec<u8>), DatabaseOpenError> {
    let (header, header_size) = parse_outer_header(data, warnings)?;
    let header_bytes = data[..header_size].to_vec();

    let payload_encrypted = data
        .get(header_size..)
        .ok_or(DatabaseIntegrityError::Truncated { context: "kdbx3 body" })?;

    // derive the master key; challenge-response components are challenged
    // with the master seed
    let mut composite_key = key.composite_key(Some(&header.master_seed), options.challenge_timeout)?;
    let mut transformed_key = crate::crypt::kdf::AesKdf {
        seed: header.transform_seed.clone(),
        rounds: header.transform_rounds,
    }
    .transform_key(&composite_key, &options.cancel)?;

    let master_key = crypt::calculate_sha256(&[&header.master_seed, &transformed_key]);
    composite_key.as_mut_slice().fill(0);
    transformed_key.as_mut_slice().fill(0);

    // decrypt the payload
    let payload = header
        .outer_cipher_config
        .get_cipher(&master_key, &header.outer_iv)?
        .decrypt(payload_encrypted)
        .map_err(|_| DatabaseKeyError::IncorrectKey)?;

    // the first bytes of the plaintext must equal the header's stream start
    // bytes; a mismatch means the master key is wrong
    if payload.len() < header.stream_start.len()
        || payload[0..header.stream_start.len()] != header.stream_start[..]
    {
        return Err(DatabaseKeyError::IncorrectKey.into());
    }

    let framed = &payload[header.stream_start.len()..];
    let body_compressed = hash_block_stream::read_hash_block_stream(framed)?;

    let xml = header
        .compression_config
        .get_compression()
        .decompress(&body_compressed)
        .map_err(DatabaseIntegrityError::Decompression)?;

    // verify the header hash stored in the XML body, when present
    verify_header_hash(&header_bytes, &xml)?;

    Ok((header, header_bytes, xml))
}

/// KDBX3 stores a SHA-256 of the header inside the (encrypted) Meta element.
/// Extracting it requires only a shallow scan for the HeaderHash tag.
fn verify_header_hash(header_bytes: &[u8], xml: &[u8]) -> Result<(), DatabaseOpenError> {
    use base64::{engine::general_purpose as base64_engine, Engine as _};

    let xml_text = String::from_utf8_lossy(xml);

    let hash = xml_text
        .find("<HeaderHash>")
        .and_then(|start| {
            let rest = &xml_text[start + "<HeaderHash>".len()..];
            rest.find("</HeaderHash>").map(|end| &rest[..end])
        })
        .and_then(|b64| base64_engine::STANDARD.decode(b64.trim()).ok());

    if let Some(hash) = hash {
        if hash != crypt::calculate_sha256(&[header_bytes]).as_slice() {
            return Err(DatabaseIntegrityError::HeaderHashMismatch.into());
        }
    }

    Ok(())
}

fn parse_outer_header(
    data: &[u8],
    warnings: &mut Warnings,
) -> Result<(Kdbx3OuterHeader, usize), DatabaseOpenError> {
    let version = DatabaseVersion::parse(data, warnings)?;

    let mut reader = SliceReader::new(data, "kdbx3 outer header");
    reader.read_bytes(DatabaseVersion::get_version_header_size())?;

    let mut outer_cipher_config: Option<OuterCipherConfig> = None;
    let mut compression_config: Option<CompressionConfig> = None;
    let mut master_seed: Option<Vec<u8>> = None;
    let mut transform_seed: Option<Vec<u8>> = None;
    let mut transform_rounds: Option<u64> = None;
    let mut outer_iv: Option<Vec<u8>> = None;
    let mut protected_stream_key: Option<Vec<u8>> = None;
    let mut stream_start: Option<Vec<u8>> = None;
    let mut inner_cipher_config: Option<crate::config::InnerCipherConfig> = None;
    let mut unknown_fields: Vec<RawHeaderField> = Vec::new();

    // parse header fields: each is {u8 type, u16le len, data}, ending with a
    // field of type HEADER_END
    loop {
        let entry_type = reader.read_u8()?;
        let entry_length = reader.read_u16()? as usize;
        let entry_buffer = reader.read_bytes(entry_length)?;

        match entry_type {
            HEADER_END => break,

            HEADER_COMMENT => {}

            HEADER_OUTER_ENCRYPTION_ID => {
                outer_cipher_config = Some(OuterCipherConfig::try_from(entry_buffer)?);
            }

            HEADER_COMPRESSION_ID => {
                if entry_buffer.len() < 4 {
                    return Err(DatabaseIntegrityError::Truncated {
                        context: "compression flag",
                    }
                    .into());
                }
                compression_config =
                    Some(CompressionConfig::try_from(LittleEndian::read_u32(entry_buffer))?);
            }

            HEADER_MASTER_SEED => master_seed = Some(entry_buffer.to_vec()),

            HEADER_TRANSFORM_SEED => transform_seed = Some(entry_buffer.to_vec()),

            HEADER_TRANSFORM_ROUNDS => {
                if entry_buffer.len() < 8 {
                    return Err(DatabaseIntegrityError::Truncated {
                        context: "transform rounds",
                    }
                    .into());
                }
                transform_rounds = Some(LittleEndian::read_u64(entry_buffer));
            }

            HEADER_ENCRYPTION_IV => outer_iv = Some(entry_buffer.to_vec()),

            HEADER_PROTECTED_STREAM_KEY => protected_stream_key = Some(entry_buffer.to_vec()),

            HEADER_STREAM_START_BYTES => stream_start = Some(entry_buffer.to_vec()),

            HEADER_INNER_RANDOM_STREAM_ID => {
                if entry_buffer.len() < 4 {
                    return Err(DatabaseIntegrityError::Truncated {
                        context: "inner stream id",
                    }
                    .into());
                }
                inner_cipher_config = Some(crate::config::InnerCipherConfig::try_from(
                    LittleEndian::read_u32(entry_buffer),
                )?);
            }

            _ => {
                warnings.push(Warning::UnknownHeaderField {
                    field_type: entry_type,
                });
                unknown_fields.push(RawHeaderField {
                    field_type: entry_type,
                    data: entry_buffer.to_vec(),
                });
            }
        };
    }

    fn get_or_err<T>(v: Option<T>, err: &str) -> Result<T, DatabaseIntegrityError> {
        v.ok_or_else(|| DatabaseIntegrityError::IncompleteOuterHeader {
            missing_field: err.into(),
        })
    }

    let outer_cipher_config = get_or_err(outer_cipher_config, "Outer Cipher ID")?;
    let compression_config = get_or_err(compression_config, "Compression ID")?;
    let master_seed = get_or_err(master_seed, "Master seed")?;
    let transform_seed = get_or_err(transform_seed, "Transform seed")?;
    let transform_rounds = get_or_err(transform_rounds, "Number of transformation rounds")?;
    let outer_iv = get_or_err(outer_iv, "Outer cipher IV")?;
    let protected_stream_key = get_or_err(protected_stream_key, "Protected stream key")?;
    let stream_start = get_or_err(stream_start, "Stream start bytes")?;
    let inner_cipher_config = get_or_err(inner_cipher_config, "Inner cipher ID")?;

    Ok((
        Kdbx3OuterHeader {
            version,
            outer_cipher_config,
            compression_config,
            master_seed,
            transform_seed,
            transform_rounds,
            outer_iv,
            protected_stream_key,
            stream_start,
            inner_cipher_config,
            unknown_fields,
        },
        reader.position(),
    ))
}

use std::convert::TryFrom;

use byteorder::{ByteOrder, LittleEndian};

use crate::{
    config::{CompressionConfig, DatabaseConfig, OuterCipherConfig, RawHeaderField},
    crypt,
    db::{BinaryRef, Database, HeaderAttachment, OpenOptions},
    error::{
        DatabaseIntegrityError, DatabaseKeyError, DatabaseOpenError, Warning, Warnings,
    },
    format::{
        kdbx4::{
            Kdbx4InnerHeader, Kdbx4OuterHeader, HEADER_COMMENT, HEADER_COMPRESSION_ID,
            HEADER_ENCRYPTION_IV, HEADER_END, HEADER_KDF_PARAMS, HEADER_MASTER_SEED,
            HEADER_OUTER_ENCRYPTION_ID, HEADER_PUBLIC_CUSTOM_DATA, INNER_HEADER_BINARY_ATTACHMENTS,
            INNER_HEADER_END, INNER_HEADER_RANDOM_STREAM_ID, INNER_HEADER_RANDOM_STREAM_KEY,
        },
        DatabaseVersion,
    },
    crypt::kdf::Kdf,
    hmac_block_stream,
    io::SliceReader,
    key::DatabaseKey,
    variant_dictionary::VariantDictionary,
};

impl From<&[u8]> for HeaderAttachment {
    fn from(data: &[u8]) -> Self {
        let flags = data.first().copied().unwrap_or(0);
        let content = data.get(1..).unwrap_or(&[]).to_vec();

        HeaderAttachment { flags, content }
    }
}

/// Open, decrypt and parse a KDBX4 database from a source and key
pub(crate) fn parse_kdbx4(
    data: &[u8],
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<Database, DatabaseOpenError> {
    let (header, inner_header, xml) = decrypt_kdbx4_parts(data, key, options, warnings)?;

    // Initialize inner decryptor from inner header params
    let mut inner_decryptor = inner_header
        .inner_random_stream
        .get_cipher(&inner_header.inner_random_stream_key)?;

    let database_content = crate::xml_db::parse::parse(&xml, &mut *inner_decryptor)?;

    let config = DatabaseConfig {
        version: header.version,
        version_locked: false,
        outer_cipher_config: header.outer_cipher_config,
        compression_config: header.compression_config,
        inner_cipher_config: inner_header.inner_random_stream,
        kdf_config: header.kdf_config,
        public_custom_data: header.public_custom_data.unwrap_or_default(),
        unknown_header_fields: header.unknown_fields,
    };

    let mut db = Database::new(config);
    db.header_attachments = inner_header.binaries;
    db.root = database_content.root.group;
    db.deleted_objects = database_content.root.deleted_objects;
    db.meta = database_content.meta;

    // entry binaries in KDBX4 refer to the inner header pool by index
    resolve_pool_references(&mut db);

    Ok(db)
}

/// Rewrite parsed `Ref` attributes into pool indexes
fn resolve_pool_references(db: &mut Database) {
    fn fix_entry(entry: &mut crate::db::Entry) {
        for binary in entry.binaries.values_mut() {
            if let BinaryRef::MetaRef(reference) = binary {
                if let Ok(index) = reference.parse::<usize>() {
                    *binary = BinaryRef::Index(index);
                }
            }
        }
    }

    fn walk(group: &mut crate::db::Group) {
        for node in group.children.iter_mut() {
            match node {
                crate::db::Node::Group(g) => walk(g),
                crate::db::Node::Entry(e) => {
                    fix_entry(e);
                    if let Some(history) = &mut e.history {
                        for historical in history.entries.iter_mut() {
                            fix_entry(historical);
                        }
                    }
                }
            }
        }
    }

    walk(&mut db.root);
}

/// Open and decrypt a KDBX4 database, also returning the raw XML document
pub(crate) fn decrypt_kdbx4(
    data: &[u8],
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<(Kdbx4OuterHeader, Kdbx4InnerHeader, Vec<u8>, Vec<u8>), DatabaseOpenError> {
    let (header, inner_header, xml) = decrypt_kdbx4_parts(data, key, options, warnings)?;
    let payload = xml.clone();
    Ok((header, inner_header, payload, xml))
}

fn decrypt_kdbx4_parts(
    data: &[u8],
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<(Kdbx4OuterHeader, Kdbx4InnerHeader, Vec<u8>), DatabaseOpenError> {
    // parse header
    let (header, header_size) = parse_outer_header(data, warnings)?;

    // the file after the header is split into:
    //      header_sha256       - SHA-256 of the header data, for integrity
    //      header_hmac         - HMAC of the header data, for key verification
    //      hmac_block_stream   - the HMAC-verified encrypted payload
    let mut reader = SliceReader::new(&data[header_size..], "kdbx4 body");
    let header_data = &data[0..header_size];
    let header_sha256 = reader.read_bytes(32)?;
    let header_hmac = reader.read_bytes(32)?;
    let hmac_block_stream = reader
        .read_bytes(reader.remaining())
        ?;

    // derive master key from the composite key and the KDF parameters
    let mut composite_key = key.composite_key(Some(&header.master_seed), options.challenge_timeout)?;
    let mut transformed_key = header
        .kdf_config
        .get_kdf_seeded(&header.kdf_seed)
        .transform_key(&composite_key, &options.cancel)?;
    let master_key = crypt::calculate_sha256(&[&header.master_seed, &transformed_key]);
    composite_key.as_mut_slice().fill(0);

    // verify header integrity
    if header_sha256 != crypt::calculate_sha256(&[header_data]).as_slice() {
        return Err(DatabaseIntegrityError::HeaderHashMismatch.into());
    }

    // verify credentials: a wrong key fails the header HMAC
    let hmac_key = crypt::calculate_sha512(&[
        &header.master_seed,
        &transformed_key,
        &crate::hmac_block_stream::HMAC_KEY_END,
    ]);
    transformed_key.as_mut_slice().fill(0);
    let header_hmac_key = hmac_block_stream::get_hmac_block_key(u64::MAX, &hmac_key)?;
    if header_hmac != crypt::calculate_hmac(&[header_data], &header_hmac_key)?.as_slice() {
        return Err(DatabaseKeyError::IncorrectKey.into());
    }

    // read the encrypted payload from the HMAC-verified block stream
    let payload_encrypted = hmac_block_stream::read_hmac_block_stream(hmac_block_stream, &hmac_key)?;

    // decrypt and decompress
    let payload_compressed = header
        .outer_cipher_config
        .get_cipher(&master_key, &header.outer_iv)?
        .decrypt(&payload_encrypted)?;
    let payload = header
        .compression_config
        .get_compression()
        .decompress(&payload_compressed)
        .map_err(DatabaseIntegrityError::Decompression)?;

    // KDBX4 has an inner header, too - parse it
    let (inner_header, body_start) = parse_inner_header(&payload)?;

    // after the inner header is one XML document
    let xml = payload
        .get(body_start..)
        .ok_or(DatabaseIntegrityError::Truncated { context: "kdbx4 payload" })?
        .to_vec();

    Ok((header, inner_header, xml))
}

fn parse_outer_header(
    data: &[u8],
    warnings: &mut Warnings,
) -> Result<(Kdbx4OuterHeader, usize), DatabaseOpenError> {
    let version = DatabaseVersion::parse(data, warnings)?;

    let mut reader = SliceReader::new(data, "kdbx4 outer header");
    reader
        .read_bytes(DatabaseVersion::get_version_header_size())
        ?;

    let mut outer_cipher_config: Option<OuterCipherConfig> = None;
    let mut compression_config: Option<CompressionConfig> = None;
    let mut master_seed: Option<Vec<u8>> = None;
    let mut outer_iv: Option<Vec<u8>> = None;
    let mut kdf: Option<(crate::config::KdfConfig, Vec<u8>)> = None;
    let mut public_custom_data: Option<VariantDictionary> = None;
    let mut unknown_fields: Vec<RawHeaderField> = Vec::new();

    // parse header fields: each is {u8 type, u32le len, data}, ending with a
    // field of type HEADER_END
    loop {
        let entry_type = reader.read_u8()?;
        let entry_buffer = reader.read_with_len()?;

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

            HEADER_ENCRYPTION_IV => outer_iv = Some(entry_buffer.to_vec()),

            HEADER_KDF_PARAMS => {
                let vd = VariantDictionary::parse(entry_buffer, warnings)?;
                kdf = Some(<(crate::config::KdfConfig, Vec<u8>)>::try_from(&vd)?);
            }

            HEADER_PUBLIC_CUSTOM_DATA => {
                public_custom_data = Some(VariantDictionary::parse(entry_buffer, warnings)?);
            }

            _ => {
                // unrecognized fields round-trip untouched
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

    // at this point, the header needs to be fully defined - unwrap options
    // and return errors if something is missing
    fn get_or_err<T>(v: Option<T>, err: &str) -> Result<T, DatabaseIntegrityError> {
        v.ok_or_else(|| DatabaseIntegrityError::IncompleteOuterHeader {
            missing_field: err.into(),
        })
    }

    let outer_cipher_config = get_or_err(outer_cipher_config, "Outer Cipher ID")?;
    let compression_config = get_or_err(compression_config, "Compression ID")?;
    let master_seed = get_or_err(master_seed, "Master seed")?;
    let outer_iv = get_or_err(outer_iv, "Outer IV")?;
    let (kdf_config, kdf_seed) = get_or_err(kdf, "Key Derivation Function Parameters")?;

    Ok((
        Kdbx4OuterHeader {
            version,
            outer_cipher_config,
            compression_config,
            master_seed,
            outer_iv,
            kdf_config,
            kdf_seed,
            public_custom_data,
            unknown_fields,
        },
        reader.position(),
    ))
}

fn parse_inner_header(data: &[u8]) -> Result<(Kdbx4InnerHeader, usize), DatabaseOpenError> {
    let mut reader = SliceReader::new(data, "kdbx4 inner header");

    let mut inner_random_stream = None;
    let mut inner_random_stream_key = None;
    let mut binaries = Vec::new();

    loop {
        let entry_type = reader.read_u8()?;
        let entry_buffer = reader.read_with_len()?;

        match entry_type {
            INNER_HEADER_END => break,

            INNER_HEADER_RANDOM_STREAM_ID => {
                if entry_buffer.len() < 4 {
                    return Err(DatabaseIntegrityError::Truncated {
                        context: "inner stream id",
                    }
                    .into());
                }
                inner_random_stream = Some(crate::config::InnerCipherConfig::try_from(
                    LittleEndian::read_u32(entry_buffer),
                )?);
            }

            INNER_HEADER_RANDOM_STREAM_KEY => inner_random_stream_key = Some(entry_buffer.to_vec()),

            INNER_HEADER_BINARY_ATTACHMENTS => {
                let binary = HeaderAttachment::from(entry_buffer);
                binaries.push(binary);
            }

            _ => {
                return Err(DatabaseIntegrityError::InvalidInnerHeaderEntry { entry_type }.into());
            }
        }
    }

    fn get_or_err<T>(v: Option<T>, err: &str) -> Result<T, DatabaseIntegrityError> {
        v.ok_or_else(|| DatabaseIntegrityError::IncompleteInnerHeader {
            missing_field: err.into(),
        })
    }

    let inner_random_stream = get_or_err(inner_random_stream, "Inner random stream ID")?;
    let inner_random_stream_key = get_or_err(inner_random_stream_key, "Inner random stream key")?;

    Ok((
        Kdbx4InnerHeader {
            inner_random_stream,
            inner_random_stream_key,
            binaries,
        },
        reader.position(),
    ))
}

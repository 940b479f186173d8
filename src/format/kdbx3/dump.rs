use byteorder::{ByteOrder, LittleEndian};

use crate::{
    config::KdfConfig,
    crypt::{self, kdf::Kdf},
    db::{Database, OpenOptions},
    error::{DatabaseSaveError, Warning, Warnings},
    format::kdbx3::{
        HEADER_COMPRESSION_ID, HEADER_ENCRYPTION_IV, HEADER_END, HEADER_INNER_RANDOM_STREAM_ID,
        HEADER_MASTER_SEED, HEADER_OUTER_ENCRYPTION_ID, HEADER_PROTECTED_STREAM_KEY,
        HEADER_STREAM_START_BYTES, HEADER_TRANSFORM_ROUNDS, HEADER_TRANSFORM_SEED,
        STREAM_START_BYTES_SIZE,
    },
    hash_block_stream,
    key::DatabaseKey,
    xml_db::dump::DumpContext,
};

/// Serialize a database to the KDBX3 wire format.
///
/// Only the AES key transformation can be expressed in this format; all
/// seeds, IVs and stream keys are freshly randomized.
pub(crate) fn dump_kdbx3(
    db: &Database,
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<Vec<u8>, DatabaseSaveError> {
    let transform_rounds = match db.config.kdf_config {
        KdfConfig::Aes { rounds } => rounds,
        _ => return Err(DatabaseSaveError::UnsupportedVersion),
    };

    if let crate::config::OuterCipherConfig::AES128 = db.config.outer_cipher_config {
        warnings.push(Warning::WeakCipher { name: "aes128" });
    }

    // KDBX3 carries binaries in the Meta pool or inline per entry; pool
    // index references from a KDBX4 load are inlined
    let mut db = db.clone();
    db.inline_binaries();

    let mut master_seed = vec![0u8; 32];
    getrandom::getrandom(&mut master_seed)?;

    let mut transform_seed = vec![0u8; 32];
    getrandom::getrandom(&mut transform_seed)?;

    let mut outer_iv = vec![0u8; db.config.outer_cipher_config.get_iv_size()];
    getrandom::getrandom(&mut outer_iv)?;

    let mut protected_stream_key = vec![0u8; 32];
    getrandom::getrandom(&mut protected_stream_key)?;

    let mut stream_start = vec![0u8; STREAM_START_BYTES_SIZE];
    getrandom::getrandom(&mut stream_start)?;

    // assemble the outer header
    let mut data: Vec<u8> = Vec::new();
    db.config.version.dump(&mut data)?;

    write_header_field(&mut data, HEADER_OUTER_ENCRYPTION_ID, &db.config.outer_cipher_config.dump());
    write_header_field(&mut data, HEADER_COMPRESSION_ID, &db.config.compression_config.dump());

    write_header_field(&mut data, HEADER_MASTER_SEED, &master_seed);
    write_header_field(&mut data, HEADER_TRANSFORM_SEED, &transform_seed);

    let mut rounds_buf = [0u8; 8];
    LittleEndian::write_u64(&mut rounds_buf, transform_rounds);
    write_header_field(&mut data, HEADER_TRANSFORM_ROUNDS, &rounds_buf);

    write_header_field(&mut data, HEADER_ENCRYPTION_IV, &outer_iv);
    write_header_field(&mut data, HEADER_PROTECTED_STREAM_KEY, &protected_stream_key);
    write_header_field(&mut data, HEADER_STREAM_START_BYTES, &stream_start);

    let mut stream_id_buf = [0u8; 4];
    LittleEndian::write_u32(&mut stream_id_buf, db.config.inner_cipher_config.dump());
    write_header_field(&mut data, HEADER_INNER_RANDOM_STREAM_ID, &stream_id_buf);

    for field in &db.config.unknown_header_fields {
        write_header_field(&mut data, field.field_type, &field.data);
    }

    write_header_field(&mut data, HEADER_END, &[]);

    // the header hash is carried inside the XML body
    db.meta.header_hash = Some(crypt::calculate_sha256(&[&data]).to_vec());

    // derive keys
    let mut composite_key = key.composite_key(Some(&master_seed), options.challenge_timeout)?;
    let mut transformed_key = crate::crypt::kdf::AesKdf {
        seed: transform_seed,
        rounds: transform_rounds,
    }
    .transform_key(&composite_key, &options.cancel)?;
    let master_key = crypt::calculate_sha256(&[&master_seed, &transformed_key]);
    composite_key.as_mut_slice().fill(0);
    transformed_key.as_mut_slice().fill(0);

    // serialize the XML body
    let mut inner_cipher = db
        .config
        .inner_cipher_config
        .get_cipher(&protected_stream_key)?;

    let mut xml = Vec::new();
    let mut ctx = DumpContext::new(&mut *inner_cipher, db.safe_ref());
    crate::xml_db::dump::dump(&db, &mut ctx, &mut xml)?;

    let body_compressed = db
        .config
        .compression_config
        .get_compression()
        .compress(&xml)
        .map_err(DatabaseSaveError::Compression)?;

    // plaintext payload: stream start bytes, then the hash block stream
    let mut payload = stream_start;
    payload.extend_from_slice(&hash_block_stream::write_hash_block_stream(&body_compressed));

    let payload_encrypted = db
        .config
        .outer_cipher_config
        .get_cipher(&master_key, &outer_iv)?
        .encrypt(&payload)?;

    data.extend_from_slice(&payload_encrypted);

    Ok(data)
}

fn write_header_field(data: &mut Vec<u8>, field_id: u8, field_value: &[u8]) {
    data.push(field_id);
    let mut len_buf = [0u8; 2];
    LittleEndian::write_u16(&mut len_buf, field_value.len() as u16);
    data.extend_from_slice(&len_buf);
    data.extend_from_slice(field_value);
}

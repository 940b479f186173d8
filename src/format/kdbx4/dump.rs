use byteorder::{ByteOrder, LittleEndian};

use crate::{
    config::OuterCipherConfig,
    crypt::{self, kdf::Kdf},
    db::{Database, HeaderAttachment, OpenOptions},
    error::{DatabaseSaveError, Warning, Warnings},
    format::kdbx4::{
        HEADER_COMPRESSION_ID, HEADER_ENCRYPTION_IV, HEADER_END, HEADER_KDF_PARAMS,
        HEADER_MASTER_SEED, HEADER_MASTER_SEED_SIZE, HEADER_OUTER_ENCRYPTION_ID,
        HEADER_PUBLIC_CUSTOM_DATA, INNER_HEADER_BINARY_ATTACHMENTS, INNER_HEADER_END,
        INNER_HEADER_RANDOM_STREAM_ID, INNER_HEADER_RANDOM_STREAM_KEY,
        INNER_RANDOM_STREAM_KEY_SIZE,
    },
    hmac_block_stream,
    key::DatabaseKey,
    xml_db::dump::DumpContext,
};

/// Serialize a database to the KDBX4 wire format.
///
/// All seeds, IVs and the inner stream key are freshly randomized on every
/// call.
pub(crate) fn dump_kdbx4(
    db: &Database,
    key: &DatabaseKey,
    options: &OpenOptions,
    warnings: &mut Warnings,
) -> Result<Vec<u8>, DatabaseSaveError> {
    if let OuterCipherConfig::AES128 = db.config.outer_cipher_config {
        warnings.push(Warning::WeakCipher { name: "aes128" });
    }

    // KDBX4 stores binaries in the inner header pool; inline attachments
    // are moved there before serialization
    let mut db = db.clone();
    db.pool_binaries();
    let db = &db;

    let mut master_seed = vec![0; HEADER_MASTER_SEED_SIZE];
    getrandom::getrandom(&mut master_seed)?;

    let mut outer_iv = vec![0; db.config.outer_cipher_config.get_iv_size()];
    getrandom::getrandom(&mut outer_iv)?;

    let mut inner_random_stream_key = vec![0; INNER_RANDOM_STREAM_KEY_SIZE];
    getrandom::getrandom(&mut inner_random_stream_key)?;

    let (kdf, kdf_seed) = db.config.kdf_config.get_kdf_and_seed()?;

    // dump the outer header, followed by its hash and HMAC
    let mut data: Vec<u8> = Vec::new();
    dump_outer_header(db, &master_seed, &outer_iv, &kdf_seed, key, &mut data)?;
    let header_data_size = data.len();

    let header_sha256 = crypt::calculate_sha256(&[&data]);
    data.extend_from_slice(&header_sha256);

    // derive the master and HMAC keys
    let mut composite_key = key.composite_key(Some(&master_seed), options.challenge_timeout)?;
    let mut transformed_key = kdf.transform_key(&composite_key, &options.cancel)?;
    let master_key = crypt::calculate_sha256(&[&master_seed, &transformed_key]);

    let hmac_key = crypt::calculate_sha512(&[
        &master_seed,
        &transformed_key,
        &hmac_block_stream::HMAC_KEY_END,
    ]);
    composite_key.as_mut_slice().fill(0);
    transformed_key.as_mut_slice().fill(0);
    let header_hmac_key = hmac_block_stream::get_hmac_block_key(u64::MAX, &hmac_key)?;
    let header_hmac = crypt::calculate_hmac(&[&data[0..header_data_size]], &header_hmac_key)?;
    data.extend_from_slice(&header_hmac);

    // assemble the payload: inner header, then the XML document
    let mut payload: Vec<u8> = Vec::new();
    dump_inner_header(db, &inner_random_stream_key, &mut payload);

    let mut inner_cipher = db
        .config
        .inner_cipher_config
        .get_cipher(&inner_random_stream_key)?;

    let mut ctx = DumpContext::new(&mut *inner_cipher, db.safe_ref());
    crate::xml_db::dump::dump(db, &mut ctx, &mut payload)?;

    // compress, encrypt, and frame into the HMAC block stream
    let payload_compressed = db
        .config
        .compression_config
        .get_compression()
        .compress(&payload)
        .map_err(DatabaseSaveError::Compression)?;

    let payload_encrypted = db
        .config
        .outer_cipher_config
        .get_cipher(&master_key, &outer_iv)?
        .encrypt(&payload_compressed)?;

    let payload_hmac = hmac_block_stream::write_hmac_block_stream(&payload_encrypted, &hmac_key)?;
    data.extend_from_slice(&payload_hmac);

    Ok(data)
}

fn write_header_field(header_data: &mut Vec<u8>, field_id: u8, field_value: &[u8]) {
    header_data.push(field_id);
    let pos = header_data.len();
    header_data.resize(pos + 4, 0);
    LittleEndian::write_u32(&mut header_data[pos..pos + 4], field_value.len() as u32);
    header_data.extend_from_slice(field_value);
}

fn dump_outer_header(
    db: &Database,
    master_seed: &[u8],
    outer_iv: &[u8],
    kdf_seed: &[u8],
    key: &DatabaseKey,
    header_data: &mut Vec<u8>,
) -> Result<(), DatabaseSaveError> {
    db.config.version.dump(header_data)?;

    write_header_field(
        header_data,
        HEADER_OUTER_ENCRYPTION_ID,
        &db.config.outer_cipher_config.dump(),
    );

    write_header_field(
        header_data,
        HEADER_COMPRESSION_ID,
        &db.config.compression_config.dump(),
    );

    write_header_field(header_data, HEADER_ENCRYPTION_IV, outer_iv);

    write_header_field(header_data, HEADER_MASTER_SEED, master_seed);

    let vd = db
        .config
        .kdf_config
        .to_variant_dictionary(kdf_seed, key.has_challenge_keys());
    let mut vd_data = Vec::new();
    vd.dump(&mut vd_data)?;
    write_header_field(header_data, HEADER_KDF_PARAMS, &vd_data);

    if !db.config.public_custom_data.is_empty() {
        let mut pcd_data = Vec::new();
        db.config.public_custom_data.dump(&mut pcd_data)?;
        write_header_field(header_data, HEADER_PUBLIC_CUSTOM_DATA, &pcd_data);
    }

    for field in &db.config.unknown_header_fields {
        write_header_field(header_data, field.field_type, &field.data);
    }

    write_header_field(header_data, HEADER_END, &[]);

    Ok(())
}

fn dump_inner_header(db: &Database, inner_random_stream_key: &[u8], payload: &mut Vec<u8>) {
    let mut stream_id_data = [0u8; 4];
    LittleEndian::write_u32(&mut stream_id_data, db.config.inner_cipher_config.dump());
    write_header_field(payload, INNER_HEADER_RANDOM_STREAM_ID, &stream_id_data);

    write_header_field(payload, INNER_HEADER_RANDOM_STREAM_KEY, inner_random_stream_key);

    for binary in &db.header_attachments {
        write_header_field(payload, INNER_HEADER_BINARY_ATTACHMENTS, &binary.dump());
    }

    write_header_field(payload, INNER_HEADER_END, &[]);
}

impl HeaderAttachment {
    fn dump(&self) -> Vec<u8> {
        let mut attachment: Vec<u8> = Vec::with_capacity(1 + self.content.len());
        attachment.push(self.flags);
        attachment.extend_from_slice(&self.content);
        attachment
    }
}

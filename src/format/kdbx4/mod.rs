mod dump;
mod parse;

pub(crate) use dump::dump_kdbx4;
pub(crate) use parse::{decrypt_kdbx4, parse_kdbx4};

use crate::{
    config::{CompressionConfig, InnerCipherConfig, KdfConfig, OuterCipherConfig},
    format::DatabaseVersion,
    variant_dictionary::VariantDictionary,
};

/// Size for a master seed in bytes
pub const HEADER_MASTER_SEED_SIZE: usize = 32;
/// Size of the generated inner stream key in bytes
pub const INNER_RANDOM_STREAM_KEY_SIZE: usize = 64;

/// Header entry denoting the end of the header
pub const HEADER_END: u8 = 0;
/// Header entry denoting a comment
pub const HEADER_COMMENT: u8 = 1;
/// A UUID specifying which cipher suite should be used to encrypt the payload
pub const HEADER_OUTER_ENCRYPTION_ID: u8 = 2;
/// First byte determines compression of payload
pub const HEADER_COMPRESSION_ID: u8 = 3;
/// Master seed for deriving the master key
pub const HEADER_MASTER_SEED: u8 = 4;
/// Initialization Vector for decrypting the payload
pub const HEADER_ENCRYPTION_IV: u8 = 7;
/// Parameters for the key derivation function
pub const HEADER_KDF_PARAMS: u8 = 11;
/// Custom data of plugins/ports
pub const HEADER_PUBLIC_CUSTOM_DATA: u8 = 12;

/// Inner header entry denoting the end of the inner header
pub const INNER_HEADER_END: u8 = 0x00;
/// Inner header entry denoting the ID of the inner cipher
pub const INNER_HEADER_RANDOM_STREAM_ID: u8 = 0x01;
/// Inner header entry denoting the key of the inner cipher
pub const INNER_HEADER_RANDOM_STREAM_KEY: u8 = 0x02;
/// Inner header entry denoting a binary attachment
pub const INNER_HEADER_BINARY_ATTACHMENTS: u8 = 0x03;

pub(crate) struct Kdbx4OuterHeader {
    pub(crate) version: DatabaseVersion,
    pub(crate) outer_cipher_config: OuterCipherConfig,
    pub(crate) compression_config: CompressionConfig,
    pub(crate) master_seed: Vec<u8>,
    pub(crate) outer_iv: Vec<u8>,
    pub(crate) kdf_config: KdfConfig,
    pub(crate) kdf_seed: Vec<u8>,
    pub(crate) public_custom_data: Option<VariantDictionary>,
    pub(crate) unknown_fields: Vec<crate::config::RawHeaderField>,
}

pub(crate) struct Kdbx4InnerHeader {
    pub(crate) inner_random_stream: InnerCipherConfig,
    pub(crate) inner_random_stream_key: Vec<u8>,
    pub(crate) binaries: Vec<crate::db::HeaderAttachment>,
}

#[cfg(test)]
mod kdbx4_tests {
    use super::*;

    use crate::{
        config::{CompressionConfig, DatabaseConfig, InnerCipherConfig, KdfConfig, OuterCipherConfig},
        db::{fields, Database, Entry, Group, NodeRef, OpenOptions},
        error::{DatabaseOpenError, DatabaseKeyError, Warnings},
        format::KDBX4_CURRENT_MINOR_VERSION,
        key::{ChallengeResponseKey, DatabaseKey},
    };

    fn dump_and_parse(db: &Database, key: &DatabaseKey) -> Database {
        let mut warnings = Warnings::new();
        let options = OpenOptions::default();

        let encrypted = dump_kdbx4(db, key, &options, &mut warnings).unwrap();
        parse_kdbx4(&encrypted, key, &options, &mut Warnings::new()).unwrap()
    }

    fn test_with_config(config: DatabaseConfig) {
        let mut db = Database::new(config);

        let mut entry_with_password = Entry::new();
        entry_with_password.set_unprotected(fields::TITLE, "Demo Entry");
        entry_with_password.set_protected(fields::PASSWORD, "secret");
        db.root.add_child(entry_with_password);

        db.root.add_child(Entry::new());
        db.root.add_child(Entry::new());

        let db_key = DatabaseKey::new().with_password("test-password");

        let decrypted_db = dump_and_parse(&db, &db_key);

        assert_eq!(decrypted_db.root.entries().len(), 3);

        let the_entry = match decrypted_db.root.get(&["Demo Entry"]) {
            Some(NodeRef::Entry(e)) => e,
            _ => panic!("could not find entry"),
        };

        assert_eq!(the_entry.get_password(), Some("secret"));
        assert_eq!(decrypted_db, db);
    }

    #[test]
    fn test_config_matrix() {
        let outer_cipher_configs = [
            OuterCipherConfig::AES256,
            OuterCipherConfig::Twofish,
            OuterCipherConfig::Serpent,
            OuterCipherConfig::ChaCha20,
        ];

        let compression_configs = [CompressionConfig::None, CompressionConfig::GZip];

        let inner_cipher_configs = [
            InnerCipherConfig::Plain,
            InnerCipherConfig::Salsa20,
            InnerCipherConfig::ChaCha20,
        ];

        let kdf_configs = [
            KdfConfig::Aes { rounds: 10 },
            KdfConfig::Argon2 {
                iterations: 10,
                memory: 65536,
                parallelism: 2,
                version: argon2::Version::Version13,
            },
            KdfConfig::Argon2id {
                iterations: 10,
                memory: 65536,
                parallelism: 2,
                version: argon2::Version::Version13,
            },
        ];

        for outer_cipher_config in &outer_cipher_configs {
            for compression_config in &compression_configs {
                for inner_cipher_config in &inner_cipher_configs {
                    for kdf_config in &kdf_configs {
                        let config = DatabaseConfig {
                            version: DatabaseVersion::KDB4(KDBX4_CURRENT_MINOR_VERSION),
                            outer_cipher_config: outer_cipher_config.clone(),
                            compression_config: compression_config.clone(),
                            inner_cipher_config: inner_cipher_config.clone(),
                            kdf_config: kdf_config.clone(),
                            ..Default::default()
                        };

                        test_with_config(config);
                    }
                }
            }
        }
    }

    #[test]
    fn wrong_key_is_detected_by_header_hmac() {
        let mut db = Database::new(DatabaseConfig::default());
        db.root.add_child(Entry::new());

        let mut warnings = Warnings::new();
        let options = OpenOptions::default();

        let encrypted = dump_kdbx4(
            &db,
            &DatabaseKey::new().with_password("right"),
            &options,
            &mut warnings,
        )
        .unwrap();

        let result = parse_kdbx4(
            &encrypted,
            &DatabaseKey::new().with_password("wrong"),
            &options,
            &mut Warnings::new(),
        );

        assert!(matches!(
            result,
            Err(DatabaseOpenError::Key(DatabaseKeyError::IncorrectKey))
        ));
    }

    #[test]
    fn payload_corruption_is_detected_by_block_hmac() {
        let mut db = Database::new(DatabaseConfig::default());
        db.root.add_child(Entry::new());

        let key = DatabaseKey::new().with_password("pw");
        let options = OpenOptions::default();

        let mut encrypted = dump_kdbx4(&db, &key, &options, &mut Warnings::new()).unwrap();

        // flip a bit late in the file, well inside the HMAC block stream
        let index = encrypted.len() - 40;
        encrypted[index] ^= 0x01;

        let result = parse_kdbx4(&encrypted, &key, &options, &mut Warnings::new());
        assert!(result.is_err());
    }

    #[test]
    fn challenge_response_key_round_trip() {
        let mut db = Database::new(DatabaseConfig::default());
        db.root.add_child(Entry::new());

        let make_key = || {
            DatabaseKey::new()
                .with_password("pw")
                .with_challenge_response_key(ChallengeResponseKey::new(|challenge: &[u8]| {
                    // a deterministic stand-in for a hardware token
                    Ok(crate::crypt::calculate_sha256(&[b"token-secret", challenge]).to_vec())
                }))
        };

        let decrypted = dump_and_parse(&db, &make_key());
        assert_eq!(decrypted.root.entries().len(), 1);

        // without the challenge-response component the key must not work
        let options = OpenOptions::default();
        let encrypted = dump_kdbx4(&db, &make_key(), &options, &mut Warnings::new()).unwrap();
        let result = parse_kdbx4(
            &encrypted,
            &DatabaseKey::new().with_password("pw"),
            &options,
            &mut Warnings::new(),
        );
        assert!(matches!(
            result,
            Err(DatabaseOpenError::Key(DatabaseKeyError::IncorrectKey))
        ));
    }

    #[test]
    fn public_custom_data_round_trips() {
        let mut db = Database::new(DatabaseConfig::default());
        db.config.public_custom_data.set("plugin-setting", 42u32);
        db.root.add_child(Entry::new());

        let key = DatabaseKey::new().with_password("pw");
        let decrypted = dump_and_parse(&db, &key);

        assert_eq!(
            decrypted.config.public_custom_data.get::<u32>("plugin-setting").unwrap(),
            &42
        );
        assert_eq!(decrypted, db);
    }

    #[test]
    fn header_attachments_round_trip() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut entry = Entry::new();
        entry.set_unprotected(fields::TITLE, "Demo entry");
        entry.binaries.insert(
            "hello.txt".to_string(),
            crate::db::BinaryRef::Inline(crate::db::BinaryValue {
                data: b"Hello, World!".to_vec(),
                protect: false,
            }),
        );
        entry.binaries.insert(
            "image.png".to_string(),
            crate::db::BinaryRef::Inline(crate::db::BinaryValue {
                data: vec![0x89, 0x50, 0x4E, 0x47],
                protect: true,
            }),
        );
        db.root.add_child(entry);

        let key = DatabaseKey::new().with_password("test");
        let decrypted = dump_and_parse(&db, &key);

        // inline binaries moved into the pool on save
        assert_eq!(decrypted.header_attachments.len(), 2);

        let the_entry = match decrypted.root.get(&["Demo entry"]) {
            Some(NodeRef::Entry(e)) => e,
            _ => panic!("could not find entry"),
        };

        let hello = the_entry.binaries.get("hello.txt").unwrap();
        assert_eq!(decrypted.binary_content(hello).unwrap(), b"Hello, World!");

        let image = the_entry.binaries.get("image.png").unwrap();
        assert_eq!(decrypted.binary_content(image).unwrap(), &[0x89, 0x50, 0x4E, 0x47][..]);
    }

    #[test]
    fn locked_database_saves_through_the_safe() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut entry = Entry::new();
        entry.set_unprotected(fields::TITLE, "locked");
        entry.set_protected(fields::PASSWORD, "still-here");
        db.root.add_child(entry);

        db.lock().unwrap();
        assert!(db.is_locked());

        let key = DatabaseKey::new().with_password("pw");
        let decrypted = dump_and_parse(&db, &key);

        let the_entry = match decrypted.root.get(&["locked"]) {
            Some(NodeRef::Entry(e)) => e,
            _ => panic!("could not find entry"),
        };
        assert_eq!(the_entry.get_password(), Some("still-here"));
    }

    #[test]
    fn deleted_objects_round_trip() {
        let mut db = Database::new(DatabaseConfig::default());
        db.deleted_objects
            .add(uuid::Uuid::new_v4(), crate::db::Times::now());

        let key = DatabaseKey::new().with_password("pw");
        let decrypted = dump_and_parse(&db, &key);

        assert_eq!(decrypted, db);
    }
}

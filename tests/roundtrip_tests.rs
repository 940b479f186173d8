use anyhow::Result;

use kdbx_db::config::{
    CompressionConfig, DatabaseConfig, DatabaseVersion, InnerCipherConfig, KdfConfig,
    OuterCipherConfig,
};
use kdbx_db::db::{fields, Entry, Group, NodeRef};
use kdbx_db::error::{DatabaseKeyError, DatabaseOpenError};
use kdbx_db::{Database, DatabaseKey};

fn bank_database() -> Database {
    let config = DatabaseConfig {
        version: DatabaseVersion::KDB4(0),
        outer_cipher_config: OuterCipherConfig::ChaCha20,
        compression_config: CompressionConfig::GZip,
        inner_cipher_config: InnerCipherConfig::ChaCha20,
        kdf_config: KdfConfig::Aes { rounds: 100 },
        ..Default::default()
    };

    let mut db = Database::new(config);

    let mut group = Group::new("Pwd");
    let mut entry = Entry::new();
    entry.set_unprotected(fields::TITLE, "My Bank");
    entry.set_protected(fields::PASSWORD, "s3cr3t");
    group.add_child(entry);
    db.root.add_child(group);

    db
}

#[test]
fn password_only_round_trip_v4_aes_kdf_chacha20() -> Result<()> {
    let db = bank_database();

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("M@st3r"))?;

    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("M@st3r"))?;

    assert_eq!(reloaded.config.version.major(), 4);

    let entries = reloaded.root.all_entries();
    assert_eq!(entries.len(), 1);

    let entry = entries[0];
    assert_eq!(entry.get_title(), Some("My Bank"));
    assert_eq!(entry.get_password(), Some("s3cr3t"));
    assert!(entry.fields.get(fields::PASSWORD).unwrap().is_protected());

    Ok(())
}

#[test]
fn wrong_key_on_v4_reports_invalid_key() -> Result<()> {
    let db = bank_database();

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("M@st3r"))?;

    let result = Database::parse(&buffer, DatabaseKey::new().with_password("wrong"));

    assert!(matches!(
        result,
        Err(DatabaseOpenError::Key(DatabaseKeyError::IncorrectKey))
    ));

    Ok(())
}

#[test]
fn database_equality_modulo_fresh_seeds() -> Result<()> {
    // parse(serialize(D)) == D: seeds and IVs are freshly randomized but do
    // not participate in database equality
    let db = bank_database();

    let key = || DatabaseKey::new().with_password("pw");

    let mut first = Vec::new();
    db.save(&mut first, key())?;
    let mut second = Vec::new();
    db.save(&mut second, key())?;

    // two saves of the same database differ on the wire (fresh seeds)
    assert_ne!(first, second);

    // but parse back to the same database
    let from_first = Database::parse(&first, key())?;
    let from_second = Database::parse(&second, key())?;
    assert_eq!(from_first, from_second);
    assert_eq!(from_first, db);

    Ok(())
}

#[test]
fn empty_database_round_trips() -> Result<()> {
    let db = Database::new(DatabaseConfig::default());

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;

    assert_eq!(reloaded.root.name, "Root");
    assert!(reloaded.root.all_entries().is_empty());
    assert_eq!(reloaded, db);

    Ok(())
}

#[test]
fn keyfile_and_password_round_trip() -> Result<()> {
    let db = bank_database();

    let keyfile_data = b"some keyfile contents, hashed into a key";
    let make_key = || -> Result<DatabaseKey> {
        Ok(DatabaseKey::new()
            .with_password("pw")
            .with_keyfile(&mut &keyfile_data[..])?)
    };

    let mut buffer = Vec::new();
    db.save(&mut buffer, make_key()?)?;

    let reloaded = Database::parse(&buffer, make_key()?)?;
    assert_eq!(reloaded, db);

    // password alone must not open the database
    let result = Database::parse(&buffer, DatabaseKey::new().with_password("pw"));
    assert!(matches!(
        result,
        Err(DatabaseOpenError::Key(DatabaseKeyError::IncorrectKey))
    ));

    Ok(())
}

#[test]
fn get_version_reads_the_magic_only() -> Result<()> {
    let db = bank_database();

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let version = Database::get_version(&mut buffer.as_slice())?;
    assert_eq!(version.major(), 4);

    Ok(())
}

#[test]
fn get_xml_decrypts_the_inner_document() -> Result<()> {
    let db = bank_database();

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let xml = Database::get_xml(&mut buffer.as_slice(), DatabaseKey::new().with_password("pw"))?;
    let xml_text = String::from_utf8_lossy(&xml);

    assert!(xml_text.contains("<KeePassFile>"));
    assert!(xml_text.contains("My Bank"));
    // the password is protected by the inner stream, never in the clear
    assert!(!xml_text.contains("s3cr3t"));

    Ok(())
}

#[test]
fn history_round_trips_through_the_file() -> Result<()> {
    let mut db = bank_database();

    // commit a change so the entry gains a historical version
    let entry_uuid = db.root.all_entries()[0].uuid;
    {
        let mut tx = db.entry_transaction(&entry_uuid).unwrap();
        tx.set_protected(fields::PASSWORD, "n3w-s3cr3t");
        tx.commit();
    }

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;
    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;

    let entry = reloaded.root.all_entries()[0];
    assert_eq!(entry.get_password(), Some("n3w-s3cr3t"));
    assert_eq!(entry.history_entries().len(), 1);
    assert_eq!(entry.history_entries()[0].get_password(), Some("s3cr3t"));

    // historical entries share the current entry's UUID
    assert_eq!(entry.history_entries()[0].uuid, entry.uuid);

    Ok(())
}

#[test]
fn locked_database_round_trips_protected_values() -> Result<()> {
    let mut db = bank_database();
    db.lock().unwrap();

    // a locked database can still be saved; the safe supplies plaintexts
    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;
    let entry = reloaded.root.all_entries()[0];
    assert_eq!(entry.get_password(), Some("s3cr3t"));

    // and the original can be unlocked again afterwards
    db.unlock().unwrap();
    let entry = db.root.all_entries()[0];
    assert_eq!(entry.get_password(), Some("s3cr3t"));

    Ok(())
}

#[test]
fn single_protected_password_on_locked_database() -> Result<()> {
    let mut db = bank_database();
    let entry_uuid = db.root.all_entries()[0].uuid;

    db.lock().unwrap();

    let entry = db.current_entry(&entry_uuid).unwrap();

    // absent while locked
    assert_eq!(entry.get_password(), None);

    // retrievable through peek
    let value = entry.fields.get(fields::PASSWORD).unwrap().clone();
    assert_eq!(db.peek_value(&value).as_deref(), Some("s3cr3t"));

    // and restored on unlock
    db.unlock().unwrap();
    assert_eq!(db.current_entry(&entry_uuid).unwrap().get_password(), Some("s3cr3t"));

    Ok(())
}

#[test]
fn v3_database_round_trip() -> Result<()> {
    let config = DatabaseConfig {
        version: DatabaseVersion::KDB3(1),
        outer_cipher_config: OuterCipherConfig::AES256,
        compression_config: CompressionConfig::GZip,
        inner_cipher_config: InnerCipherConfig::Salsa20,
        kdf_config: KdfConfig::Aes { rounds: 100 },
        ..Default::default()
    };

    let mut db = Database::new(config);
    let mut entry = Entry::new();
    entry.set_unprotected(fields::TITLE, "Legacy");
    entry.set_protected(fields::PASSWORD, "v3-secret");
    db.root.add_child(entry);

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let version = Database::get_version(&mut buffer.as_slice())?;
    assert_eq!(version, DatabaseVersion::KDB3(1));

    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;
    let entry = match reloaded.root.get(&["Legacy"]) {
        Some(NodeRef::Entry(e)) => e,
        _ => panic!("entry not found"),
    };
    assert_eq!(entry.get_password(), Some("v3-secret"));
    assert!(entry.fields.get(fields::PASSWORD).unwrap().is_protected());

    Ok(())
}

use anyhow::Result;

use kdbx_db::config::{
    CompressionConfig, DatabaseConfig, DatabaseVersion, InnerCipherConfig, KdfConfig,
    OuterCipherConfig,
};
use kdbx_db::db::{fields, CustomDataItem, Entry, Group, NodeRef, OpenOptions, Value};
use kdbx_db::error::{BlockStreamError, DatabaseIntegrityError, DatabaseOpenError, Warning, Warnings};
use kdbx_db::ident::format_uuid;
use kdbx_db::placeholder::PlaceholderRegistry;
use kdbx_db::{Database, DatabaseKey};

fn v3_config() -> DatabaseConfig {
    DatabaseConfig {
        version: DatabaseVersion::KDB3(1),
        outer_cipher_config: OuterCipherConfig::AES256,
        compression_config: CompressionConfig::GZip,
        inner_cipher_config: InnerCipherConfig::Salsa20,
        kdf_config: KdfConfig::Aes { rounds: 100 },
        ..Default::default()
    }
}

#[test]
fn corruption_in_v3_hash_block_region_is_detected() -> Result<()> {
    let mut db = Database::new(DatabaseConfig {
        // no compression so the bit flip lands in block data, not in gzip
        // framing
        compression_config: CompressionConfig::None,
        outer_cipher_config: OuterCipherConfig::ChaCha20,
        ..v3_config()
    });
    let mut entry = Entry::new();
    entry.set_unprotected(fields::TITLE, "target");
    entry.set_unprotected(fields::NOTES, "x".repeat(256).as_str());
    db.root.add_child(entry);

    let key = || DatabaseKey::new().with_password("pw");

    let mut buffer = Vec::new();
    db.save(&mut buffer, key())?;

    // flip one bit inside the hash-blocked region
    let index = buffer.len() - 64;
    buffer[index] ^= 0x01;

    let result = Database::parse(&buffer, key());

    assert!(matches!(
        result,
        Err(DatabaseOpenError::DatabaseIntegrity(
            DatabaseIntegrityError::BlockStream(BlockStreamError::BlockHashMismatch { .. })
        ))
    ));

    Ok(())
}

#[test]
fn custom_data_triggers_auto_upgrade_to_v4() -> Result<()> {
    let mut db = Database::new(v3_config());

    let mut entry = Entry::new();
    entry.set_unprotected(fields::TITLE, "upgrade trigger");
    entry.custom_data.items.insert(
        "x".to_string(),
        CustomDataItem {
            value: Some(Value::Unprotected("y".to_string())),
            last_modification_time: None,
        },
    );
    db.root.add_child(entry);

    assert_eq!(db.minimum_version(), DatabaseVersion::KDB4(0));

    let mut warnings = Warnings::new();
    let mut buffer = Vec::new();
    db.save_with(
        &mut buffer,
        DatabaseKey::new().with_password("pw"),
        &OpenOptions::default(),
        &mut warnings,
    )?;

    // exactly one upgrade warning
    let upgrades: Vec<_> = warnings
        .as_slice()
        .iter()
        .filter(|w| matches!(w, Warning::VersionUpgraded { .. }))
        .collect();
    assert_eq!(upgrades.len(), 1);

    // the file on disk is v4.0 even though the config said v3
    let version = Database::get_version(&mut buffer.as_slice())?;
    assert_eq!(version, DatabaseVersion::KDB4(0));

    // the in-memory handle keeps its configured version
    assert_eq!(db.config.version, DatabaseVersion::KDB3(1));

    Ok(())
}

#[test]
fn locked_version_is_not_upgraded() -> Result<()> {
    let mut db = Database::new(v3_config());
    db.config.version_locked = true;

    let mut entry = Entry::new();
    entry.custom_data.items.insert(
        "x".to_string(),
        CustomDataItem {
            value: Some(Value::Unprotected("y".to_string())),
            last_modification_time: None,
        },
    );
    db.root.add_child(entry);

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;

    let version = Database::get_version(&mut buffer.as_slice())?;
    assert_eq!(version, DatabaseVersion::KDB3(1));

    Ok(())
}

#[test]
fn field_reference_rewrite_on_uuid_change() -> Result<()> {
    let mut db = Database::new(DatabaseConfig::default());

    let mut a = Entry::new();
    a.set_unprotected(fields::TITLE, "A");
    a.set_protected(fields::PASSWORD, "a-password");
    let a_uuid = a.uuid;
    db.root.add_child(a);

    let mut b = Entry::new();
    b.set_unprotected(fields::TITLE, "B");
    b.set_unprotected(
        fields::PASSWORD,
        &format!("{{REF:P@I:{}}}", format_uuid(&a_uuid, None)),
    );
    let b_uuid = b.uuid;
    db.root.add_child(b);

    // change A's UUID; every reference must follow
    let new_uuid = uuid::Uuid::new_v4();
    db.change_uuid(&a_uuid, new_uuid);

    // round trip through the file
    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;
    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;

    let b = reloaded.current_entry(&b_uuid).unwrap();
    assert_eq!(
        b.get_password().unwrap(),
        format!("{{REF:P@I:{}}}", format_uuid(&new_uuid, None))
    );

    // the reference resolves to A's password
    let registry = PlaceholderRegistry::default();
    let expanded = reloaded
        .expanded_value(&b_uuid, fields::PASSWORD, &registry)
        .unwrap();
    assert_eq!(expanded, "a-password");

    Ok(())
}

#[test]
fn recycle_bin_lifecycle() -> Result<()> {
    let mut db = Database::new(DatabaseConfig::default());
    db.meta.recyclebin_enabled = Some(true);

    let mut group = Group::new("Projects");
    let mut entry = Entry::new();
    entry.set_unprotected(fields::TITLE, "project entry");
    let entry_uuid = entry.uuid;
    group.add_child(entry);
    let group_uuid = group.uuid;
    db.root.add_child(group);

    let bin_uuid = db.recycle_object(&group_uuid).expect("group should be recycled");

    // the group and its entries now live under the autovivified bin
    let bin = match db.root.get(&["Recycle Bin"]) {
        Some(NodeRef::Group(g)) => g,
        _ => panic!("no recycle bin group"),
    };
    assert_eq!(bin.uuid, bin_uuid);
    assert_eq!(bin.groups().len(), 1);
    assert_eq!(bin.groups()[0].uuid, group_uuid);
    assert_eq!(bin.groups()[0].entries()[0].uuid, entry_uuid);

    // the bin is excluded from searching and auto-type
    assert_eq!(bin.enable_searching, Some(false));
    assert_eq!(bin.enable_autotype, Some(false));
    assert_eq!(db.effective_enable_searching(&group_uuid), Some(false));
    assert_eq!(db.effective_enable_auto_type(&group_uuid), Some(false));

    // survives a round trip
    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;
    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;

    assert_eq!(reloaded.meta.recyclebin_uuid, Some(bin_uuid));
    assert!(reloaded.current_entry(&entry_uuid).is_some());

    Ok(())
}

#[test]
fn hard_removal_records_deleted_objects() -> Result<()> {
    let mut db = Database::new(DatabaseConfig::default());

    let entry = Entry::new();
    let entry_uuid = entry.uuid;
    db.root.add_child(entry);

    db.remove_object(&entry_uuid);
    assert!(db.deleted_objects.contains(entry_uuid));

    let mut buffer = Vec::new();
    db.save(&mut buffer, DatabaseKey::new().with_password("pw"))?;
    let reloaded = Database::parse(&buffer, DatabaseKey::new().with_password("pw"))?;

    assert!(reloaded.deleted_objects.contains(entry_uuid));
    assert!(reloaded.current_entry(&entry_uuid).is_none());

    Ok(())
}

#[test]
fn commit_history_respects_database_caps() -> Result<()> {
    let mut db = Database::new(DatabaseConfig::default());
    db.meta.history_max_items = Some(5);

    let entry = Entry::new();
    let entry_uuid = entry.uuid;
    db.root.add_child(entry);

    for i in 0..20 {
        let mut tx = db.entry_transaction(&entry_uuid).unwrap();
        tx.set_unprotected(fields::TITLE, &format!("title {}", i));
        tx.commit();
    }

    let entry = db.current_entry(&entry_uuid).unwrap();
    assert!(entry.history_entries().len() <= 5);
    assert_eq!(entry.get_title(), Some("title 19"));

    Ok(())
}

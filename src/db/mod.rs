//! Types for representing data contained in a KDBX database

pub(crate) mod entry;
pub mod fields;
pub(crate) mod group;
pub(crate) mod meta;
pub(crate) mod node;
pub(crate) mod safe;
pub(crate) mod transaction;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::str::FromStr;
use std::time::Duration;

use chrono::NaiveDateTime;
use secstr::SecStr;
use uuid::Uuid;

pub use crate::db::{
    entry::{AutoType, AutoTypeAssociation, BinaryRef, BinaryValue, Entry, History, HistoryCaps, LockedValue, Value},
    group::Group,
    meta::{BinaryAttachment, BinaryAttachments, CustomIcons, Icon, MemoryProtection, Meta},
    node::{IterOptions, Node, NodeRef, NodeRefMut, Object, TraversalOrder},
    safe::Safe,
    transaction::{EntryTransaction, GroupTransaction},
};

use crate::{
    cancel::CancelToken,
    config::DatabaseConfig,
    error::{
        DatabaseIntegrityError, DatabaseOpenError, DatabaseSaveError, ParseColorError, Warning,
        Warnings,
    },
    format::{kdbx3, kdbx4, DatabaseVersion, KDBX3_CURRENT_MINOR_VERSION},
    key::{DatabaseKey, DEFAULT_CHALLENGE_TIMEOUT},
    placeholder::{self, PlaceholderRegistry},
};

/// Caller-tunable knobs for load and save operations
#[derive(Debug, Clone)]
pub struct OpenOptions {
    /// Cancellation signal checked during key derivation
    pub cancel: CancelToken,

    /// How long to wait for challenge-response responders
    pub challenge_timeout: Duration,
}

impl Default for OpenOptions {
    fn default() -> Self {
        Self {
            cancel: CancelToken::new(),
            challenge_timeout: DEFAULT_CHALLENGE_TIMEOUT,
        }
    }
}

/// A decrypted KDBX database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Database {
    /// Configuration settings of the database such as encryption and compression algorithms
    pub config: DatabaseConfig,

    /// Binary attachments in the inner header (KDBX4)
    pub header_attachments: Vec<HeaderAttachment>,

    /// Root group of the database
    pub root: Group,

    /// References to previously-deleted objects
    pub deleted_objects: DeletedObjects,

    /// Metadata of the database
    pub meta: Meta,

    /// When locked, holds the keystream protecting secret strings in memory
    safe: Option<Safe>,
}

impl Database {
    /// Create a new, empty database with an implicit root group
    pub fn new(config: DatabaseConfig) -> Database {
        Self {
            config,
            header_attachments: Vec::new(),
            root: Group::new("Root"),
            deleted_objects: Default::default(),
            meta: Default::default(),
            safe: None,
        }
    }

    /// Parse a database from a std::io::Read
    pub fn open(source: &mut dyn std::io::Read, key: DatabaseKey) -> Result<Database, DatabaseOpenError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;

        Database::parse(data.as_ref(), key)
    }

    pub fn parse(data: &[u8], key: DatabaseKey) -> Result<Database, DatabaseOpenError> {
        let mut warnings = Warnings::new();
        Database::parse_with(data, key, &OpenOptions::default(), &mut warnings)
    }

    /// Parse a database, collecting non-fatal conditions into `warnings`
    pub fn parse_with(
        data: &[u8],
        key: DatabaseKey,
        options: &OpenOptions,
        warnings: &mut Warnings,
    ) -> Result<Database, DatabaseOpenError> {
        // version sniffing only; the format parsers read the header again
        // and report their own warnings
        let database_version = DatabaseVersion::parse(data, &mut Warnings::new())?;

        let db = match database_version {
            DatabaseVersion::KDB3(_) => kdbx3::parse_kdbx3(data, &key, options, warnings)?,
            DatabaseVersion::KDB4(_) => kdbx4::parse_kdbx4(data, &key, options, warnings)?,
        };

        db.validate_loaded(warnings);

        Ok(db)
    }

    /// Save a database to a std::io::Write.
    ///
    /// The complete output is assembled in memory first, so a failed save
    /// never leaves partial bytes in the destination.
    pub fn save(
        &self,
        destination: &mut dyn std::io::Write,
        key: DatabaseKey,
    ) -> Result<(), DatabaseSaveError> {
        let mut warnings = Warnings::new();
        self.save_with(destination, key, &OpenOptions::default(), &mut warnings)
    }

    /// Save a database, collecting non-fatal conditions into `warnings`
    pub fn save_with(
        &self,
        destination: &mut dyn std::io::Write,
        key: DatabaseKey,
        options: &OpenOptions,
        warnings: &mut Warnings,
    ) -> Result<(), DatabaseSaveError> {
        let minimum = self.minimum_version();

        let db;
        let effective = if self.config.version < minimum && !self.config.version_locked {
            warnings.push(Warning::VersionUpgraded {
                from: self.config.version.to_string(),
                to: minimum.to_string(),
            });

            let mut upgraded = self.clone();
            upgraded.config.version = minimum;
            db = upgraded;
            &db
        } else {
            self
        };

        let data = match effective.config.version {
            DatabaseVersion::KDB3(_) => kdbx3::dump_kdbx3(effective, &key, options, warnings)?,
            DatabaseVersion::KDB4(_) => kdbx4::dump_kdbx4(effective, &key, options, warnings)?,
        };

        destination.write_all(&data)?;

        Ok(())
    }

    /// Helper function to load a database into its internal XML chunks
    pub fn get_xml(source: &mut dyn std::io::Read, key: DatabaseKey) -> Result<Vec<u8>, DatabaseOpenError> {
        let mut data = Vec::new();
        source.read_to_end(&mut data)?;

        let mut warnings = Warnings::new();
        let options = OpenOptions::default();

        let database_version = DatabaseVersion::parse(data.as_ref(), &mut warnings)?;

        let xml = match database_version {
            DatabaseVersion::KDB3(_) => kdbx3::decrypt_kdbx3(data.as_ref(), &key, &options, &mut warnings)?.2,
            DatabaseVersion::KDB4(_) => kdbx4::decrypt_kdbx4(data.as_ref(), &key, &options, &mut warnings)?.3,
        };

        Ok(xml)
    }

    /// Get the version of a database without decrypting it
    pub fn get_version(source: &mut dyn std::io::Read) -> Result<DatabaseVersion, DatabaseIntegrityError> {
        let mut data = vec![0; DatabaseVersion::get_version_header_size()];
        source.read_exact(&mut data)?;
        DatabaseVersion::parse(data.as_ref(), &mut Warnings::new())
    }

    /// The caps applied to entry history on commit, from the database
    /// metadata with format defaults
    pub fn history_caps(&self) -> HistoryCaps {
        let defaults = HistoryCaps::default();
        HistoryCaps {
            max_items: self.meta.history_max_items.unwrap_or(defaults.max_items),
            max_size: self.meta.history_max_size.unwrap_or(defaults.max_size),
            max_age_days: defaults.max_age_days,
        }
    }

    /// The lowest file version able to represent this database's content
    pub fn minimum_version(&self) -> DatabaseVersion {
        if self.requires_kdbx41() {
            return DatabaseVersion::KDB4(1);
        }

        if self.requires_kdbx40() {
            return DatabaseVersion::KDB4(0);
        }

        DatabaseVersion::KDB3(KDBX3_CURRENT_MINOR_VERSION)
    }

    fn requires_kdbx41(&self) -> bool {
        let icon_needs = self
            .meta
            .custom_icons
            .icons
            .iter()
            .any(|icon| icon.name.is_some() || icon.last_modification_time.is_some());

        if icon_needs {
            return true;
        }

        let meta_custom_data_times = self
            .meta
            .custom_data
            .items
            .values()
            .any(|item| item.last_modification_time.is_some());

        if meta_custom_data_times {
            return true;
        }

        self.root
            .deep_iter(IterOptions::new().with_history())
            .any(|node| {
                let object = match node {
                    NodeRef::Group(g) => g as &dyn Object,
                    NodeRef::Entry(e) => e as &dyn Object,
                };

                if object.previous_parent_group().is_some() || !object.tag_list().is_empty() {
                    return true;
                }

                if object
                    .custom_data()
                    .items
                    .values()
                    .any(|item| item.last_modification_time.is_some())
                {
                    return true;
                }

                matches!(node, NodeRef::Entry(e) if e.quality_check == Some(false))
            })
    }

    fn requires_kdbx40(&self) -> bool {
        if !matches!(self.config.kdf_config, crate::config::KdfConfig::Aes { .. }) {
            return true;
        }

        if !self.config.public_custom_data.is_empty() {
            return true;
        }

        if !self.meta.custom_data.items.is_empty() {
            return true;
        }

        self.root
            .deep_iter(IterOptions::new().with_history())
            .any(|node| match node {
                NodeRef::Group(g) => !g.custom_data.items.is_empty(),
                NodeRef::Entry(e) => !e.custom_data.items.is_empty(),
            })
    }

    /// Post-load validation for conditions that are reported but tolerated
    fn validate_loaded(&self, warnings: &mut Warnings) {
        let mut seen: HashSet<Uuid> = HashSet::new();

        for node in self.root.iter() {
            let uuid = node.uuid();
            if !seen.insert(uuid) {
                warnings.push(Warning::DuplicateUuid { uuid });
            }

            let times = match node {
                NodeRef::Group(g) => &g.times,
                NodeRef::Entry(e) => &e.times,
            };

            if times
                .times
                .values()
                .any(|t| *t == NaiveDateTime::MAX || *t == NaiveDateTime::MIN)
            {
                warnings.push(Warning::TimestampOutOfRange { uuid });
            }
        }
    }

    // ---- memory protection -------------------------------------------------

    /// Whether protected strings are currently locked away in the safe
    pub fn is_locked(&self) -> bool {
        self.safe.is_some()
    }

    pub(crate) fn safe_ref(&self) -> Option<&Safe> {
        self.safe.as_ref()
    }

    /// Move every protected string value into a freshly-keyed safe.
    ///
    /// Values are walked in document order; the plaintext containers are
    /// zeroed as they are consumed.
    pub fn lock(&mut self) -> Result<(), getrandom::Error> {
        if self.safe.is_some() {
            return Ok(());
        }

        let mut safe = Safe::new()?;

        for_each_value_mut(&mut self.root, &mut |value| {
            if let Value::Protected(plaintext) = value {
                let (slot, ciphertext) = safe.add(plaintext.unsecure());
                *value = Value::Locked(LockedValue { slot, ciphertext });
            }
        });

        self.safe = Some(safe);
        Ok(())
    }

    /// Restore every locked value from the safe.
    ///
    /// Unlocking is atomic: if any slot fails to resolve, the database is
    /// left unchanged and an error is returned.
    pub fn unlock(&mut self) -> Result<(), DatabaseIntegrityError> {
        let safe = match self.safe.take() {
            Some(safe) => safe,
            None => return Ok(()),
        };

        // resolve everything before mutating anything
        let mut resolved: HashMap<usize, Vec<u8>> = HashMap::new();
        let mut failed = false;

        for_each_value(&self.root, &mut |value| {
            if let Value::Locked(locked) = value {
                match safe.peek(locked.slot, &locked.ciphertext) {
                    Some(plaintext) => {
                        resolved.insert(locked.slot, plaintext);
                    }
                    None => failed = true,
                }
            }
        });

        if failed {
            self.safe = Some(safe);
            return Err(DatabaseIntegrityError::Invariant {
                message: "database safe does not cover all locked values".to_string(),
            });
        }

        for_each_value_mut(&mut self.root, &mut |value| {
            if let Value::Locked(locked) = value {
                if let Some(plaintext) = resolved.get(&locked.slot) {
                    *value = Value::Protected(SecStr::new(plaintext.clone()));
                }
            }
        });

        Ok(())
    }

    /// Decrypt a single locked value through the safe without unlocking the
    /// database
    pub fn peek_value(&self, value: &Value) -> Option<String> {
        match value {
            Value::Locked(locked) => {
                let safe = self.safe.as_ref()?;
                let plaintext = safe.peek(locked.slot, &locked.ciphertext)?;
                String::from_utf8(plaintext).ok()
            }
            Value::Protected(p) => std::str::from_utf8(p.unsecure()).ok().map(str::to_string),
            Value::Unprotected(u) => Some(u.clone()),
            Value::Bytes(_) => None,
        }
    }

    // ---- lineage and inherited state ---------------------------------------

    /// The chain of groups from the root down to (and including) the group
    /// with the given UUID
    pub fn lineage(&self, group_uuid: &Uuid) -> Option<Vec<&Group>> {
        fn descend<'a>(group: &'a Group, target: &Uuid, path: &mut Vec<&'a Group>) -> bool {
            path.push(group);
            if &group.uuid == target {
                return true;
            }
            for sub in group.groups() {
                if descend(sub, target, path) {
                    return true;
                }
            }
            path.pop();
            false
        }

        let mut path = Vec::new();
        if descend(&self.root, group_uuid, &mut path) {
            Some(path)
        } else {
            None
        }
    }

    /// Dot-joined group names from depth 1 down to the group, excluding the
    /// root
    pub fn group_path(&self, group_uuid: &Uuid) -> Option<String> {
        let lineage = self.lineage(group_uuid)?;
        Some(
            lineage
                .iter()
                .skip(1)
                .map(|g| g.name.as_str())
                .collect::<Vec<_>>()
                .join("."),
        )
    }

    /// Number of ancestors between the group and the root
    pub fn group_depth(&self, group_uuid: &Uuid) -> Option<usize> {
        Some(self.lineage(group_uuid)?.len() - 1)
    }

    /// Resolve the inheritable searching flag for a group
    pub fn effective_enable_searching(&self, group_uuid: &Uuid) -> Option<bool> {
        let lineage = self.lineage(group_uuid)?;
        Some(
            lineage
                .iter()
                .fold(true, |inherited, g| g.enable_searching.unwrap_or(inherited)),
        )
    }

    /// Resolve the inheritable auto-type flag for a group
    pub fn effective_enable_auto_type(&self, group_uuid: &Uuid) -> Option<bool> {
        let lineage = self.lineage(group_uuid)?;
        Some(
            lineage
                .iter()
                .fold(true, |inherited, g| g.enable_autotype.unwrap_or(inherited)),
        )
    }

    /// Resolve the inherited default auto-type sequence for a group
    pub fn effective_default_auto_type_sequence(&self, group_uuid: &Uuid) -> Option<String> {
        let lineage = self.lineage(group_uuid)?;
        let mut sequence = None;
        for group in lineage {
            if group.default_autotype_sequence.is_some() {
                sequence = group.default_autotype_sequence.clone();
            }
        }
        sequence
    }

    /// The group that directly contains the object with the given UUID
    pub fn parent_group(&self, uuid: &Uuid) -> Option<&Group> {
        fn find<'a>(group: &'a Group, target: &Uuid) -> Option<&'a Group> {
            if group.children.iter().any(|n| n.uuid() == *target) {
                return Some(group);
            }
            for sub in group.groups() {
                if let Some(found) = find(sub, target) {
                    return Some(found);
                }
            }
            None
        }

        find(&self.root, uuid)
    }

    /// Find an entry anywhere in the tree by UUID. Historical versions are
    /// never returned; this is the "current" entry for that UUID.
    pub fn current_entry(&self, uuid: &Uuid) -> Option<&Entry> {
        self.root.iter().find_map(|node| match node {
            NodeRef::Entry(e) if e.uuid == *uuid => Some(e),
            _ => None,
        })
    }

    pub(crate) fn entry_mut(&mut self, uuid: &Uuid) -> Option<&mut Entry> {
        fn find<'a>(group: &'a mut Group, target: &Uuid) -> Option<&'a mut Entry> {
            for node in group.children.iter_mut() {
                match node {
                    Node::Entry(e) if e.uuid == *target => return Some(e),
                    Node::Group(g) => {
                        if let Some(found) = find(g, target) {
                            return Some(found);
                        }
                    }
                    _ => {}
                }
            }
            None
        }

        find(&mut self.root, uuid)
    }

    /// Start a transaction over the entry with the given UUID, using this
    /// database's history caps
    pub fn entry_transaction(&mut self, uuid: &Uuid) -> Option<EntryTransaction<'_>> {
        let caps = self.history_caps();
        let entry = self.entry_mut(uuid)?;
        Some(entry.begin_work(caps))
    }

    // ---- removal and recycling ---------------------------------------------

    /// Detach an object from the tree and record it in the deleted objects
    /// list. The root group cannot be removed.
    pub fn remove_object(&mut self, uuid: &Uuid) -> Option<Node> {
        if *uuid == self.root.uuid {
            return None;
        }

        let node = detach(&mut self.root, uuid)?;
        self.deleted_objects.add(*uuid, Times::now());
        Some(node)
    }

    /// Soft-delete an object: move it under the recycle bin when recycling
    /// is enabled, otherwise remove it outright.
    ///
    /// Returns the UUID of the recycle bin if the object was recycled.
    pub fn recycle_object(&mut self, uuid: &Uuid) -> Option<Uuid> {
        if *uuid == self.root.uuid {
            return None;
        }

        if self.meta.recyclebin_enabled != Some(true) {
            self.remove_object(uuid);
            return None;
        }

        // detach first so that a recycle bin created below can never be the
        // object's own subtree
        let old_parent = self.parent_group(uuid).map(|g| g.uuid);
        let mut node = detach(&mut self.root, uuid)?;

        let bin_uuid = self.ensure_recycle_bin();

        let now = Times::now();
        match &mut node {
            Node::Group(g) => {
                g.previous_parent_group = old_parent;
                g.times.set_location_changed(now);
            }
            Node::Entry(e) => {
                e.previous_parent_group = old_parent;
                e.times.set_location_changed(now);
            }
        }

        if let Some(bin) = group_mut(&mut self.root, &bin_uuid) {
            bin.children.push(node);
        }

        Some(bin_uuid)
    }

    /// The recycle bin group, autovivified on first use with searching and
    /// auto-type disabled
    pub fn ensure_recycle_bin(&mut self) -> Uuid {
        if let Some(uuid) = self.meta.recyclebin_uuid {
            if group_mut(&mut self.root, &uuid).is_some() {
                return uuid;
            }
        }

        let mut bin = Group::new("Recycle Bin");
        bin.icon_id = Some(43);
        bin.enable_searching = Some(false);
        bin.enable_autotype = Some(false);
        bin.is_expanded = false;

        let uuid = bin.uuid;
        self.root.add_child(bin);

        self.meta.recyclebin_uuid = Some(uuid);
        self.meta.recyclebin_changed = Some(Times::now());

        uuid
    }

    // ---- identity ----------------------------------------------------------

    /// Change an object's UUID, rewriting every reference to it: field
    /// reference tokens in entry strings, metadata pointers, previous parent
    /// groups, last-top-visible entries and deleted object records.
    pub fn change_uuid(&mut self, old: &Uuid, new: Uuid) {
        fn rewrite_entry(entry: &mut Entry, old: &Uuid, new: &Uuid) {
            let mut rewrites: Vec<(String, Value)> = Vec::new();

            for (key, value) in entry.fields.iter() {
                match value {
                    Value::Unprotected(text) => {
                        if let Some(rewritten) = placeholder::rewrite_ref_tokens(text, old, new) {
                            rewrites.push((key.clone(), Value::Unprotected(rewritten)));
                        }
                    }
                    Value::Protected(secret) => {
                        if let Ok(text) = std::str::from_utf8(secret.unsecure()) {
                            if let Some(rewritten) = placeholder::rewrite_ref_tokens(text, old, new) {
                                rewrites.push((key.clone(), Value::Protected(SecStr::from(rewritten))));
                            }
                        }
                    }
                    _ => {}
                }
            }

            for (key, value) in rewrites {
                entry.fields.insert(key, value);
            }

            if entry.previous_parent_group == Some(*old) {
                entry.previous_parent_group = Some(*new);
            }
        }

        fn walk(group: &mut Group, old: &Uuid, new: &Uuid) {
            if group.uuid == *old {
                group.uuid = *new;
            }
            if group.previous_parent_group == Some(*old) {
                group.previous_parent_group = Some(*new);
            }
            if group.last_top_visible_entry == Some(*old) {
                group.last_top_visible_entry = Some(*new);
            }

            for node in group.children.iter_mut() {
                match node {
                    Node::Group(g) => walk(g, old, new),
                    Node::Entry(e) => {
                        if e.uuid == *old {
                            e.uuid = *new;
                        }
                        rewrite_entry(e, old, new);
                        if let Some(history) = &mut e.history {
                            for historical in history.entries.iter_mut() {
                                if historical.uuid == *old {
                                    historical.uuid = *new;
                                }
                                rewrite_entry(historical, old, new);
                            }
                        }
                    }
                }
            }
        }

        walk(&mut self.root, old, &new);

        if self.meta.recyclebin_uuid == Some(*old) {
            self.meta.recyclebin_uuid = Some(new);
        }
        if self.meta.entry_templates_group == Some(*old) {
            self.meta.entry_templates_group = Some(new);
        }
        if self.meta.last_selected_group == Some(*old) {
            self.meta.last_selected_group = Some(new);
        }
        if self.meta.last_top_visible_group == Some(*old) {
            self.meta.last_top_visible_group = Some(new);
        }

        for deleted in self.deleted_objects.objects.iter_mut() {
            if deleted.uuid == *old {
                deleted.uuid = new;
            }
        }
    }

    // ---- placeholder expansion ---------------------------------------------

    /// Read an entry's field with placeholders and field references expanded
    pub fn expanded_value(
        &self,
        entry_uuid: &Uuid,
        key: &str,
        registry: &PlaceholderRegistry,
    ) -> Option<String> {
        let entry = self.current_entry(entry_uuid)?;
        let raw = entry.get(key)?;
        Some(placeholder::expand(self, entry, raw, registry))
    }

    // ---- binary attachment normalization -----------------------------------

    /// Resolve an entry's binary to its bytes, dereferencing pool indexes
    pub fn binary_content<'a>(&'a self, binary: &'a BinaryRef) -> Option<&'a [u8]> {
        match binary {
            BinaryRef::Inline(value) => Some(&value.data),
            BinaryRef::Index(index) => self.header_attachments.get(*index).map(|a| a.content.as_slice()),
            BinaryRef::MetaRef(identifier) => self
                .meta
                .binaries
                .by_identifier(identifier)
                .map(|b| b.content.as_slice()),
        }
    }

    /// Move all inline entry binaries into the header attachment pool,
    /// replacing them with index references (KDBX4 form)
    pub(crate) fn pool_binaries(&mut self) {
        let attachments = &mut self.header_attachments;
        let binaries = &self.meta.binaries;

        for_each_entry_mut(&mut self.root, &mut |entry| {
            for binary in entry.binaries.values_mut() {
                let (content, protect) = match binary {
                    BinaryRef::Inline(value) => (std::mem::take(&mut value.data), value.protect),
                    BinaryRef::MetaRef(identifier) => match binaries.by_identifier(identifier) {
                        Some(b) => (b.content.clone(), false),
                        None => continue,
                    },
                    BinaryRef::Index(_) => continue,
                };

                let index = attachments.len();
                attachments.push(HeaderAttachment {
                    flags: if protect { 1 } else { 0 },
                    content,
                });
                *binary = BinaryRef::Index(index);
            }
        });
    }

    /// Replace pool index references with inline binaries (KDBX3 form)
    pub(crate) fn inline_binaries(&mut self) {
        let attachments = std::mem::take(&mut self.header_attachments);

        for_each_entry_mut(&mut self.root, &mut |entry| {
            for binary in entry.binaries.values_mut() {
                if let BinaryRef::Index(index) = binary {
                    if let Some(attachment) = attachments.get(*index) {
                        *binary = BinaryRef::Inline(BinaryValue {
                            data: attachment.content.clone(),
                            protect: attachment.protected(),
                        });
                    }
                }
            }
        });
    }
}

/// Detach the node with the given UUID from wherever it is in the tree
fn detach(group: &mut Group, uuid: &Uuid) -> Option<Node> {
    if let Some(node) = group.remove_child(uuid) {
        return Some(node);
    }

    for sub in group.groups_mut() {
        if let Some(node) = detach(sub, uuid) {
            return Some(node);
        }
    }

    None
}

fn group_mut<'a>(group: &'a mut Group, uuid: &Uuid) -> Option<&'a mut Group> {
    if group.uuid == *uuid {
        return Some(group);
    }

    for sub in group.groups_mut() {
        if let Some(found) = group_mut(sub, uuid) {
            return Some(found);
        }
    }

    None
}

fn for_each_entry_mut(group: &mut Group, f: &mut impl FnMut(&mut Entry)) {
    for node in group.children.iter_mut() {
        match node {
            Node::Entry(e) => {
                f(e);
                if let Some(history) = &mut e.history {
                    for historical in history.entries.iter_mut() {
                        f(historical);
                    }
                }
            }
            Node::Group(g) => for_each_entry_mut(g, f),
        }
    }
}

/// Walk all entry string values in document order: entries before subgroups
/// is not required, only that lock and unlock agree; this uses tree order
/// with each entry's history directly after it.
fn for_each_value_mut(group: &mut Group, f: &mut impl FnMut(&mut Value)) {
    for_each_entry_mut(group, &mut |entry| {
        for value in entry.fields.values_mut() {
            f(value);
        }
    });
}

fn for_each_value(group: &Group, f: &mut impl FnMut(&Value)) {
    fn entries(group: &Group, f: &mut impl FnMut(&Value)) {
        for node in &group.children {
            match node {
                Node::Entry(e) => {
                    for value in e.fields.values() {
                        f(value);
                    }
                    for historical in e.history_entries() {
                        for value in historical.fields.values() {
                            f(value);
                        }
                    }
                }
                Node::Group(g) => entries(g, f),
            }
        }
    }

    entries(group, f);
}

/// Timestamps for a Group or Entry
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Times {
    /// Does this node expire
    pub expires: bool,

    /// Number of usages
    pub usage_count: usize,

    /// Collection of named timestamps, in UTC with 1-second resolution
    pub times: HashMap<String, NaiveDateTime>,
}

pub const EXPIRY_TIME_TAG_NAME: &str = "ExpiryTime";
pub const LAST_MODIFICATION_TIME_TAG_NAME: &str = "LastModificationTime";
pub const CREATION_TIME_TAG_NAME: &str = "CreationTime";
pub const LAST_ACCESS_TIME_TAG_NAME: &str = "LastAccessTime";
pub const LOCATION_CHANGED_TAG_NAME: &str = "LocationChanged";

impl Times {
    pub fn get(&self, key: &str) -> Option<&NaiveDateTime> {
        self.times.get(key)
    }

    pub fn get_expiry(&self) -> Option<&NaiveDateTime> {
        self.times.get(EXPIRY_TIME_TAG_NAME)
    }

    pub fn set_expiry(&mut self, time: NaiveDateTime) {
        self.times.insert(EXPIRY_TIME_TAG_NAME.to_string(), time);
    }

    pub fn get_last_modification(&self) -> Option<&NaiveDateTime> {
        self.times.get(LAST_MODIFICATION_TIME_TAG_NAME)
    }

    pub fn set_last_modification(&mut self, time: NaiveDateTime) {
        self.times
            .insert(LAST_MODIFICATION_TIME_TAG_NAME.to_string(), time);
    }

    pub fn get_creation(&self) -> Option<&NaiveDateTime> {
        self.times.get(CREATION_TIME_TAG_NAME)
    }

    pub fn set_creation(&mut self, time: NaiveDateTime) {
        self.times.insert(CREATION_TIME_TAG_NAME.to_string(), time);
    }

    pub fn get_last_access(&self) -> Option<&NaiveDateTime> {
        self.times.get(LAST_ACCESS_TIME_TAG_NAME)
    }

    pub fn set_last_access(&mut self, time: NaiveDateTime) {
        self.times.insert(LAST_ACCESS_TIME_TAG_NAME.to_string(), time);
    }

    pub fn get_location_changed(&self) -> Option<&NaiveDateTime> {
        self.times.get(LOCATION_CHANGED_TAG_NAME)
    }

    pub fn set_location_changed(&mut self, time: NaiveDateTime) {
        self.times.insert(LOCATION_CHANGED_TAG_NAME.to_string(), time);
    }

    /// The current time, truncated to whole seconds
    pub fn now() -> NaiveDateTime {
        let now = chrono::Utc::now().timestamp();
        chrono::DateTime::from_timestamp(now, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default()
    }

    pub fn epoch() -> NaiveDateTime {
        chrono::DateTime::from_timestamp(0, 0)
            .map(|dt| dt.naive_utc())
            .unwrap_or_default()
    }

    pub fn new() -> Times {
        let mut response = Times::default();
        let now = Times::now();
        response.set_creation(now);
        response.set_last_modification(now);
        response.set_last_access(now);
        response.set_location_changed(now);
        response.set_expiry(now);
        response.expires = false;
        response
    }
}

/// Collection of custom data fields for an entry, group or the database
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct CustomData {
    pub items: BTreeMap<String, CustomDataItem>,
}

/// Custom data field for an entry or metadata for internal use
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct CustomDataItem {
    pub value: Option<Value>,
    pub last_modification_time: Option<NaiveDateTime>,
}

/// Binary attachments stored in a database inner header (KDBX4)
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct HeaderAttachment {
    pub flags: u8,
    pub content: Vec<u8>,
}

impl HeaderAttachment {
    /// Whether the attachment is flagged for in-memory protection
    pub fn protected(&self) -> bool {
        self.flags & 0x01 != 0
    }
}

/// Elements that have been previously deleted
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DeletedObjects {
    pub objects: Vec<DeletedObject>,
}

impl DeletedObjects {
    pub fn contains(&self, uuid: Uuid) -> bool {
        self.objects.iter().any(|deleted| deleted.uuid == uuid)
    }

    pub fn add(&mut self, uuid: Uuid, deletion_time: NaiveDateTime) {
        self.objects.push(DeletedObject { uuid, deletion_time });
    }
}

/// A reference to a deleted element
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct DeletedObject {
    pub uuid: Uuid,
    pub deletion_time: NaiveDateTime,
}

/// A color value for the Database, or Entry
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Color {
    pub r: u8,
    pub g: u8,
    pub b: u8,
}

impl FromStr for Color {
    type Err = ParseColorError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if !s.starts_with('#') || s.len() != 7 {
            return Err(ParseColorError(s.to_string()));
        }

        let v =
            u64::from_str_radix(s.trim_start_matches('#'), 16).map_err(|_e| ParseColorError(s.to_string()))?;

        let r = ((v >> 16) & 0xff) as u8;
        let g = ((v >> 8) & 0xff) as u8;
        let b = (v & 0xff) as u8;

        Ok(Self { r, g, b })
    }
}

impl std::fmt::Display for Color {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{:02X}{:02X}{:02X}", self.r, self.g, self.b)
    }
}

#[cfg(test)]
mod database_tests {
    use super::*;

    #[test]
    fn lock_hides_protected_values_until_unlock() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut entry = Entry::new();
        entry.set_unprotected(fields::TITLE, "Mail");
        entry.set_protected(fields::PASSWORD, "hunter2");
        let entry_uuid = entry.uuid;
        db.root.add_child(entry);

        db.lock().unwrap();
        assert!(db.is_locked());

        let locked_entry = db.current_entry(&entry_uuid).unwrap();
        // the plaintext is absent from the object while locked
        assert_eq!(locked_entry.get_password(), None);
        assert_eq!(locked_entry.get_title(), Some("Mail"));

        // but can be peeked through the safe
        let value = locked_entry.fields.get(fields::PASSWORD).unwrap().clone();
        assert_eq!(db.peek_value(&value).as_deref(), Some("hunter2"));

        db.unlock().unwrap();
        assert!(!db.is_locked());

        let entry = db.current_entry(&entry_uuid).unwrap();
        assert_eq!(entry.get_password(), Some("hunter2"));
    }

    #[test]
    fn lock_covers_history_entries() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut entry = Entry::new();
        entry.set_protected(fields::PASSWORD, "current");
        let mut old = entry.clone();
        old.set_protected(fields::PASSWORD, "previous");
        entry.add_historical_entry(old);
        let uuid = entry.uuid;
        db.root.add_child(entry);

        db.lock().unwrap();
        db.unlock().unwrap();

        let entry = db.current_entry(&uuid).unwrap();
        assert_eq!(entry.get_password(), Some("current"));
        assert_eq!(entry.history_entries()[0].get_password(), Some("previous"));
    }

    #[test]
    fn recycle_moves_object_under_autovivified_bin() {
        let mut db = Database::new(DatabaseConfig::default());
        db.meta.recyclebin_enabled = Some(true);

        let mut group = Group::new("Work");
        let entry = Entry::new();
        let entry_uuid = entry.uuid;
        group.add_child(entry);
        let group_uuid = group.uuid;
        db.root.add_child(group);

        let bin_uuid = db.recycle_object(&group_uuid).unwrap();

        assert_eq!(db.meta.recyclebin_uuid, Some(bin_uuid));

        let lineage = db.lineage(&group_uuid).unwrap();
        assert_eq!(lineage[lineage.len() - 2].uuid, bin_uuid);

        // the entry travelled with its group
        let parent = db.parent_group(&entry_uuid).unwrap();
        assert_eq!(parent.uuid, group_uuid);

        // the bin is excluded from searching and auto-type
        let bin = db.lineage(&bin_uuid).unwrap().last().cloned().unwrap();
        assert_eq!(bin.enable_searching, Some(false));
        assert_eq!(bin.enable_autotype, Some(false));

        // previous parent is remembered
        let group = match db.root.get(&["Recycle Bin", "Work"]).unwrap() {
            NodeRef::Group(g) => g,
            _ => panic!("expected group"),
        };
        assert_eq!(group.previous_parent_group, Some(db.root.uuid));
    }

    #[test]
    fn remove_records_deleted_object() {
        let mut db = Database::new(DatabaseConfig::default());

        let entry = Entry::new();
        let uuid = entry.uuid;
        db.root.add_child(entry);

        let removed = db.remove_object(&uuid).unwrap();
        assert_eq!(removed.uuid(), uuid);
        assert!(db.deleted_objects.contains(uuid));
        assert!(db.current_entry(&uuid).is_none());

        // root cannot be removed
        let root_uuid = db.root.uuid;
        assert!(db.remove_object(&root_uuid).is_none());
    }

    #[test]
    fn disabled_recycling_removes_outright() {
        let mut db = Database::new(DatabaseConfig::default());

        let entry = Entry::new();
        let uuid = entry.uuid;
        db.root.add_child(entry);

        assert_eq!(db.recycle_object(&uuid), None);
        assert!(db.deleted_objects.contains(uuid));
        assert!(db.meta.recyclebin_uuid.is_none());
    }

    #[test]
    fn change_uuid_rewrites_references() {
        let mut db = Database::new(DatabaseConfig::default());

        let target = Entry::new();
        let old_uuid = target.uuid;
        db.root.add_child(target);

        let mut referrer = Entry::new();
        referrer.set_unprotected(
            fields::PASSWORD,
            &format!("{{REF:P@I:{}}}", crate::ident::format_uuid(&old_uuid, None)),
        );
        let referrer_uuid = referrer.uuid;
        db.root.add_child(referrer);

        db.meta.last_selected_group = Some(old_uuid);

        let new_uuid = Uuid::new_v4();
        db.change_uuid(&old_uuid, new_uuid);

        assert!(db.current_entry(&new_uuid).is_some());
        assert!(db.current_entry(&old_uuid).is_none());
        assert_eq!(db.meta.last_selected_group, Some(new_uuid));

        let referrer = db.current_entry(&referrer_uuid).unwrap();
        assert_eq!(
            referrer.get_password().unwrap(),
            format!("{{REF:P@I:{}}}", crate::ident::format_uuid(&new_uuid, None))
        );
    }

    #[test]
    fn minimum_version_escalates_with_features() {
        let mut db = Database::new(DatabaseConfig::default());
        db.config.kdf_config = crate::config::KdfConfig::Aes { rounds: 100 };

        assert_eq!(db.minimum_version(), DatabaseVersion::KDB3(1));

        // object custom data requires KDBX4
        let mut entry = Entry::new();
        entry.custom_data.items.insert(
            "x".to_string(),
            CustomDataItem {
                value: Some(Value::Unprotected("y".to_string())),
                last_modification_time: None,
            },
        );
        let uuid = entry.uuid;
        db.root.add_child(entry);

        assert_eq!(db.minimum_version(), DatabaseVersion::KDB4(0));

        // tags require KDBX4.1
        db.entry_mut(&uuid).unwrap().tags.push("tagged".to_string());
        assert_eq!(db.minimum_version(), DatabaseVersion::KDB4(1));

        // a non-AES KDF alone requires KDBX4
        let mut db = Database::new(DatabaseConfig::default());
        assert_eq!(db.minimum_version(), DatabaseVersion::KDB4(0));
        db.config.kdf_config = crate::config::KdfConfig::Aes { rounds: 100 };
        assert_eq!(db.minimum_version(), DatabaseVersion::KDB3(1));

        // quality_check=false requires KDBX4.1
        let mut entry = Entry::new();
        entry.quality_check = Some(false);
        db.root.add_child(entry);
        assert_eq!(db.minimum_version(), DatabaseVersion::KDB4(1));
    }

    #[test]
    fn lineage_and_effective_flags() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut outer = Group::new("Outer");
        outer.enable_searching = Some(false);
        outer.default_autotype_sequence = Some("{USERNAME}{TAB}{PASSWORD}".to_string());
        let mut inner = Group::new("Inner");
        let inner_uuid = inner.uuid;
        inner.enable_searching = None;
        outer.add_child(inner);
        db.root.add_child(outer);

        assert_eq!(db.group_path(&inner_uuid).unwrap(), "Outer.Inner");
        assert_eq!(db.group_depth(&inner_uuid), Some(2));

        // searching disabled on the parent is inherited
        assert_eq!(db.effective_enable_searching(&inner_uuid), Some(false));
        assert_eq!(db.effective_enable_auto_type(&inner_uuid), Some(true));
        assert_eq!(
            db.effective_default_auto_type_sequence(&inner_uuid).unwrap(),
            "{USERNAME}{TAB}{PASSWORD}"
        );
    }
}

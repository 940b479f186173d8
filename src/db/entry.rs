use std::collections::BTreeMap;

use chrono::NaiveDateTime;
use secstr::SecStr;
use uuid::Uuid;

use crate::db::{fields, Color, CustomData, MemoryProtection, Times};

/// A database entry containing several key-value string fields and binary
/// attachments
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct Entry {
    pub uuid: Uuid,
    pub fields: BTreeMap<String, Value>,
    pub binaries: BTreeMap<String, BinaryRef>,
    pub autotype: Option<AutoType>,
    pub tags: Vec<String>,

    pub times: Times,

    pub custom_data: CustomData,

    pub icon_id: Option<usize>,
    pub custom_icon_uuid: Option<Uuid>,

    pub foreground_color: Option<Color>,
    pub background_color: Option<Color>,

    pub override_url: Option<String>,

    /// Whether password quality checking applies to this entry. Absent means
    /// enabled; an explicit `false` requires KDBX4.1.
    pub quality_check: Option<bool>,

    /// Group this entry lived in before it was last relocated
    pub previous_parent_group: Option<Uuid>,

    pub history: Option<History>,
}

impl Entry {
    pub fn new() -> Entry {
        Entry {
            uuid: Uuid::new_v4(),
            times: Times::new(),
            ..Default::default()
        }
    }
}

impl<'a> Entry {
    /// Get a field by name, taking care of unprotecting Protected values
    /// automatically. Values locked away in the database safe are reported
    /// as absent; see [crate::Database::peek_value].
    pub fn get(&'a self, key: &str) -> Option<&'a str> {
        match self.fields.get(key) {
            Some(Value::Bytes(_)) => None,
            Some(Value::Protected(pv)) => std::str::from_utf8(pv.unsecure()).ok(),
            Some(Value::Unprotected(uv)) => Some(uv),
            Some(Value::Locked(_)) => None,
            None => None,
        }
    }

    /// Get a bytes field by name
    pub fn get_bytes(&'a self, key: &str) -> Option<&'a [u8]> {
        match self.fields.get(key) {
            Some(Value::Bytes(b)) => Some(b),
            _ => None,
        }
    }

    pub fn get_uuid(&'a self) -> &'a Uuid {
        &self.uuid
    }

    /// Set a field to an unprotected string value
    pub fn set_unprotected(&mut self, key: &str, value: &str) {
        self.fields
            .insert(key.to_string(), Value::Unprotected(value.to_string()));
    }

    /// Set a field to a protected string value
    pub fn set_protected(&mut self, key: &str, value: &str) {
        self.fields
            .insert(key.to_string(), Value::Protected(SecStr::from(value)));
    }

    /// Access a string field, autovivifying standard strings with an empty
    /// value whose protection defaults from the database memory protection
    /// policy.
    pub fn string_mut(&mut self, key: &str, protection: &MemoryProtection) -> &mut Value {
        if !self.fields.contains_key(key) && fields::is_standard(key) {
            let value = if protection.protects(key) {
                Value::Protected(SecStr::new(Vec::new()))
            } else {
                Value::Unprotected(String::new())
            };
            self.fields.insert(key.to_string(), value);
        }

        self.fields
            .entry(key.to_string())
            .or_insert_with(|| Value::Unprotected(String::new()))
    }

    /// Get a timestamp field by name
    pub fn get_time(&self, key: &str) -> Option<&NaiveDateTime> {
        self.times.get(key)
    }

    /// Convenience method for getting the time that the entry expires.
    /// This value is usually only meaningful/useful when expires == true
    pub fn get_expiry_time(&self) -> Option<&NaiveDateTime> {
        self.times.get_expiry()
    }

    /// Convenience method for getting the value of the 'Title' field
    pub fn get_title(&'a self) -> Option<&'a str> {
        self.get(fields::TITLE)
    }

    /// Convenience method for getting the value of the 'UserName' field
    pub fn get_username(&'a self) -> Option<&'a str> {
        self.get(fields::USERNAME)
    }

    /// Convenience method for getting the value of the 'Password' field
    pub fn get_password(&'a self) -> Option<&'a str> {
        self.get(fields::PASSWORD)
    }

    /// Convenience method for getting the value of the 'URL' field
    pub fn get_url(&'a self) -> Option<&'a str> {
        self.get(fields::URL)
    }

    /// The ordered list of prior versions of this entry, oldest first
    pub fn history_entries(&self) -> &[Entry] {
        match &self.history {
            Some(h) => &h.entries,
            None => &[],
        }
    }

    /// Append a prior version of this entry to its history.
    ///
    /// The snapshot's own history is discarded so that history does not
    /// nest.
    pub fn add_historical_entry(&mut self, mut snapshot: Entry) {
        snapshot.history = None;
        self.history.get_or_insert_with(History::default).entries.push(snapshot);
    }

    /// Coarse byte estimate of this entry, used for history size caps: the
    /// sum of the UTF-8 lengths of keys, values, binaries, tags and
    /// auto-type associations.
    pub fn size(&self) -> usize {
        let mut total = 0;

        for (key, value) in &self.fields {
            total += key.len() + value.byte_len();
        }

        for (key, binary) in &self.binaries {
            total += key.len();
            if let BinaryRef::Inline(value) = binary {
                total += value.data.len();
            }
        }

        for tag in &self.tags {
            total += tag.len();
        }

        if let Some(url) = &self.override_url {
            total += url.len();
        }

        if let Some(autotype) = &self.autotype {
            total += autotype.sequence.as_deref().map(str::len).unwrap_or(0);
            for association in &autotype.associations {
                total += association.window.as_deref().map(str::len).unwrap_or(0);
                total += association.sequence.as_deref().map(str::len).unwrap_or(0);
            }
        }

        total
    }

    /// Drop historical versions, oldest first, until the given caps hold.
    ///
    /// A cap of `-1` means unlimited.
    pub fn prune_history(&mut self, caps: &HistoryCaps) {
        let history = match &mut self.history {
            Some(h) => h,
            None => return,
        };

        if caps.max_age_days >= 0 {
            let cutoff = Times::now() - chrono::Duration::days(caps.max_age_days);
            history.entries.retain(|entry| {
                entry
                    .times
                    .get_last_modification()
                    .map(|t| *t >= cutoff)
                    .unwrap_or(true)
            });
        }

        if caps.max_items >= 0 {
            while history.entries.len() > caps.max_items as usize {
                history.entries.remove(0);
            }
        }

        if caps.max_size >= 0 {
            let mut total: usize = history.entries.iter().map(Entry::size).sum();
            while total > caps.max_size as usize && !history.entries.is_empty() {
                total -= history.entries.remove(0).size();
            }
        }
    }
}

/// Caps applied to entry history on commit
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryCaps {
    /// Maximum number of retained versions, -1 for no limit
    pub max_items: isize,
    /// Maximum total byte estimate of retained versions, -1 for no limit
    pub max_size: isize,
    /// Maximum age of retained versions in days, -1 for no limit
    pub max_age_days: i64,
}

impl Default for HistoryCaps {
    fn default() -> Self {
        Self {
            max_items: 10,
            max_size: 6 * 1024 * 1024,
            max_age_days: 365,
        }
    }
}

/// A value that can be a raw string, byte array, or protected memory region
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum Value {
    Bytes(Vec<u8>),
    Unprotected(String),
    Protected(SecStr),
    /// A protected value whose plaintext currently lives in the database
    /// safe; the container holds only keystream-encrypted bytes
    Locked(LockedValue),
}

impl Value {
    pub fn is_empty(&self) -> bool {
        match self {
            Value::Bytes(b) => b.is_empty(),
            Value::Unprotected(u) => u.is_empty(),
            Value::Protected(p) => p.unsecure().is_empty(),
            Value::Locked(l) => l.ciphertext.is_empty(),
        }
    }

    /// Whether this value is marked for protected storage
    pub fn is_protected(&self) -> bool {
        matches!(self, Value::Protected(_) | Value::Locked(_))
    }

    pub(crate) fn byte_len(&self) -> usize {
        match self {
            Value::Bytes(b) => b.len(),
            Value::Unprotected(u) => u.len(),
            Value::Protected(p) => p.unsecure().len(),
            Value::Locked(l) => l.ciphertext.len(),
        }
    }
}

/// Ciphertext of a value that has been moved into the database safe
#[derive(Debug, Eq, PartialEq, Clone)]
pub struct LockedValue {
    pub(crate) slot: usize,
    pub(crate) ciphertext: Vec<u8>,
}

/// Reference to a binary attachment
#[derive(Debug, Eq, PartialEq, Clone)]
pub enum BinaryRef {
    /// Index into the KDBX4 inner header binary pool
    Index(usize),
    /// Identifier into the KDBX3 Meta binary pool
    MetaRef(String),
    /// Binary embedded directly in the entry
    Inline(BinaryValue),
}

/// An embedded binary attachment value
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct BinaryValue {
    pub data: Vec<u8>,
    pub protect: bool,
}

/// An AutoType setting associated with an Entry
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct AutoType {
    pub enabled: bool,
    pub sequence: Option<String>,
    pub data_transfer_obfuscation: Option<isize>,
    pub associations: Vec<AutoTypeAssociation>,
}

/// A window association associated with an AutoType setting
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct AutoTypeAssociation {
    pub window: Option<String>,
    pub sequence: Option<String>,
}

/// An entry's history: prior versions sharing its UUID, oldest first
#[derive(Debug, Default, Eq, PartialEq, Clone)]
pub struct History {
    pub(crate) entries: Vec<Entry>,
}

impl History {
    pub fn get_entries(&self) -> &[Entry] {
        &self.entries
    }
}

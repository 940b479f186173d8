use chrono::NaiveDateTime;
use uuid::Uuid;

use crate::db::{Color, CustomData};

/// Database-level metadata
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Meta {
    /// Name of the program that wrote the database
    pub generator: Option<String>,

    pub database_name: Option<String>,
    pub database_name_changed: Option<NaiveDateTime>,

    pub database_description: Option<String>,
    pub database_description_changed: Option<NaiveDateTime>,

    pub default_username: Option<String>,
    pub default_username_changed: Option<NaiveDateTime>,

    pub maintenance_history_days: Option<usize>,

    pub color: Option<Color>,

    pub master_key_changed: Option<NaiveDateTime>,
    pub master_key_change_rec: Option<isize>,
    pub master_key_change_force: Option<isize>,

    /// Which standard strings default to protected storage
    pub memory_protection: Option<MemoryProtection>,

    pub custom_icons: CustomIcons,

    pub recyclebin_enabled: Option<bool>,
    pub recyclebin_uuid: Option<Uuid>,
    pub recyclebin_changed: Option<NaiveDateTime>,

    pub entry_templates_group: Option<Uuid>,
    pub entry_templates_group_changed: Option<NaiveDateTime>,

    pub last_selected_group: Option<Uuid>,
    pub last_top_visible_group: Option<Uuid>,

    /// Cap on the number of historical versions per entry; -1 for no limit
    pub history_max_items: Option<isize>,
    /// Cap on the total byte estimate of an entry's history; -1 for no limit
    pub history_max_size: Option<isize>,

    pub settings_changed: Option<NaiveDateTime>,

    /// SHA-256 of the outer header, stored in KDBX3 files for tamper
    /// detection before HMAC authentication existed
    pub header_hash: Option<Vec<u8>>,

    /// Binary pool stored in the Meta element (KDBX3)
    pub binaries: BinaryAttachments,

    pub custom_data: CustomData,
}

impl Meta {
    /// The memory protection policy in effect, falling back to the format
    /// default (only passwords protected)
    pub fn effective_memory_protection(&self) -> MemoryProtection {
        self.memory_protection.clone().unwrap_or_default()
    }
}

/// Which of the standard strings are stored protected in memory
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct MemoryProtection {
    pub protect_title: bool,
    pub protect_username: bool,
    pub protect_password: bool,
    pub protect_url: bool,
    pub protect_notes: bool,
}

impl Default for MemoryProtection {
    fn default() -> Self {
        Self {
            protect_title: false,
            protect_username: false,
            protect_password: true,
            protect_url: false,
            protect_notes: false,
        }
    }
}

impl MemoryProtection {
    /// Whether a string with the given key defaults to protected storage
    pub fn protects(&self, key: &str) -> bool {
        match key {
            super::fields::TITLE => self.protect_title,
            super::fields::USERNAME => self.protect_username,
            super::fields::PASSWORD => self.protect_password,
            super::fields::URL => self.protect_url,
            super::fields::NOTES => self.protect_notes,
            _ => false,
        }
    }
}

/// Icons uploaded into the database
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct CustomIcons {
    pub icons: Vec<Icon>,
}

impl CustomIcons {
    pub fn get(&self, uuid: &Uuid) -> Option<&Icon> {
        self.icons.iter().find(|icon| &icon.uuid == uuid)
    }
}

/// A custom icon. Name and modification time were introduced with KDBX4.1.
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct Icon {
    pub uuid: Uuid,
    pub data: Vec<u8>,
    pub name: Option<String>,
    pub last_modification_time: Option<NaiveDateTime>,
}

/// Binary pool in the Meta element of KDBX3 files
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct BinaryAttachments {
    pub binaries: Vec<BinaryAttachment>,
}

impl BinaryAttachments {
    pub fn by_identifier(&self, identifier: &str) -> Option<&BinaryAttachment> {
        self.binaries
            .iter()
            .find(|b| b.identifier.as_deref() == Some(identifier))
    }
}

/// A binary attachment in the KDBX3 Meta binary pool
#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct BinaryAttachment {
    pub identifier: Option<String>,
    pub compressed: bool,
    pub content: Vec<u8>,
}

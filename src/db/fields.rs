//! Standard string field names for entries.
//!
//! Every entry conceptually carries these five strings; they are
//! autovivified on access according to the database's memory protection
//! policy.

/// The title of the entry
pub const TITLE: &str = "Title";

/// The user name associated with the entry
pub const USERNAME: &str = "UserName";

/// The password associated with the entry
pub const PASSWORD: &str = "Password";

/// The primary URL associated with the entry
pub const URL: &str = "URL";

/// Notes associated with the entry
pub const NOTES: &str = "Notes";

/// The standard field names, for convenient iteration
pub const STANDARD_FIELDS: [&str; 5] = [TITLE, USERNAME, PASSWORD, URL, NOTES];

/// Whether a field name is one of the five standard strings
pub fn is_standard(key: &str) -> bool {
    STANDARD_FIELDS.contains(&key)
}

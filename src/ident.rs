//! UUID generation and formatting helpers

use uuid::Uuid;

/// Generate a cryptographically random UUID.
///
/// `accept` can reject candidates, e.g. to enforce uniqueness within a
/// database; generation retries until a candidate is accepted.
pub fn generate_uuid<F>(mut accept: F) -> Result<Uuid, getrandom::Error>
where
    F: FnMut(&Uuid) -> bool,
{
    loop {
        let mut raw = [0u8; 16];
        getrandom::getrandom(&mut raw)?;

        let candidate = Uuid::from_bytes(raw);
        if accept(&candidate) {
            return Ok(candidate);
        }
    }
}

/// Format a UUID as 32 uppercase hex characters, optionally with a delimiter
/// after positions 8, 12, 16 and 20.
pub fn format_uuid(uuid: &Uuid, delimiter: Option<char>) -> String {
    let hex: String = uuid
        .as_bytes()
        .iter()
        .map(|b| format!("{:02X}", b))
        .collect();

    match delimiter {
        None => hex,
        Some(d) => {
            let mut out = String::with_capacity(36);
            for (i, c) in hex.chars().enumerate() {
                if matches!(i, 8 | 12 | 16 | 20) {
                    out.push(d);
                }
                out.push(c);
            }
            out
        }
    }
}

/// Parse the textual UUID form used inside `{REF:...}` tokens: 32 hex
/// characters, with or without delimiters.
pub(crate) fn parse_ref_uuid(text: &str) -> Option<Uuid> {
    let stripped: String = text.chars().filter(|c| c.is_ascii_hexdigit()).collect();
    if stripped.len() != 32 {
        return None;
    }

    let raw = hex::decode(&stripped).ok()?;
    Uuid::from_slice(&raw).ok()
}

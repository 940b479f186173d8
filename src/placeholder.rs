//! Placeholder and field-reference expansion for entry string values.
//!
//! Tokens of the form `{NAME}` or `{NAME:ARG}` are substituted when a
//! handler for the name is registered; `%VAR%` substitutes process
//! environment variables; `{REF:W@S:text}` resolves a field of another
//! entry. Unknown placeholders are left verbatim. Substituted text is
//! expanded recursively, with a per-name depth limit to keep
//! self-referential values from looping.

use std::collections::HashMap;

use uuid::Uuid;

use crate::db::{fields, Database, Entry, IterOptions, NodeRef};
use crate::ident::{format_uuid, parse_ref_uuid};
use crate::query::{parse_simple_expression, QueryOp};

/// How deep one placeholder name may expand within itself
const MAX_RECURSION_DEPTH: usize = 10;

/// Context available to placeholder handlers
pub struct ExpandContext<'a> {
    pub db: &'a Database,
    pub entry: &'a Entry,
}

type Handler = Box<dyn Fn(&ExpandContext<'_>, Option<&str>) -> Option<String> + Send + Sync>;

/// Hook invoked for `{HMACOTP}` and `{TIMEOTP}`; receives the entry and the
/// placeholder name
pub type OtpProvider = Box<dyn Fn(&Entry, &str) -> Option<String> + Send + Sync>;

/// Mapping from placeholder names to handler functions.
///
/// Names that take an argument are registered with a trailing `:` (e.g.
/// `S:`); `{S:Custom}` then invokes that handler with `Custom`. The default
/// registry carries the standard KeePass placeholder set; the registry is a
/// plain value, so callers can extend or strip it without global state.
pub struct PlaceholderRegistry {
    handlers: HashMap<String, Handler>,
    otp_provider: Option<OtpProvider>,
}

impl PlaceholderRegistry {
    /// A registry without any handlers
    pub fn empty() -> Self {
        Self {
            handlers: HashMap::new(),
            otp_provider: None,
        }
    }

    /// Register a handler. The name must end in `:` iff the placeholder
    /// takes an argument. Re-registering a name replaces the old handler.
    pub fn register<F>(&mut self, name: &str, handler: F)
    where
        F: Fn(&ExpandContext<'_>, Option<&str>) -> Option<String> + Send + Sync + 'static,
    {
        self.handlers.insert(name.to_uppercase(), Box::new(handler));
    }

    /// Remove a handler, returning whether it existed
    pub fn unregister(&mut self, name: &str) -> bool {
        self.handlers.remove(&name.to_uppercase()).is_some()
    }

    /// Install the provider backing the one-time-password placeholders
    pub fn set_otp_provider(&mut self, provider: OtpProvider) {
        self.otp_provider = Some(provider);
    }

    fn lookup(&self, name: &str) -> Option<&Handler> {
        self.handlers.get(&name.to_uppercase())
    }
}

impl Default for PlaceholderRegistry {
    fn default() -> Self {
        let mut registry = Self::empty();

        for (name, field) in [
            ("TITLE", fields::TITLE),
            ("USERNAME", fields::USERNAME),
            ("PASSWORD", fields::PASSWORD),
            ("URL", fields::URL),
            ("NOTES", fields::NOTES),
        ] {
            registry.register(name, move |ctx, _arg| {
                ctx.entry.get(field).map(str::to_string)
            });
        }

        registry.register("URL:", |ctx, arg| {
            let raw = ctx.entry.get(fields::URL)?;
            url_component(raw, arg?)
        });

        registry.register("S:", |ctx, arg| ctx.entry.get(arg?).map(str::to_string));

        registry.register("UUID", |ctx, _arg| {
            Some(format_uuid(&ctx.entry.uuid, None))
        });

        registry.register("GROUP", |ctx, _arg| {
            ctx.db
                .parent_group(&ctx.entry.uuid)
                .map(|g| g.name.clone())
        });

        registry.register("GROUP_PATH", |ctx, _arg| {
            let parent = ctx.db.parent_group(&ctx.entry.uuid)?;
            ctx.db.group_path(&parent.uuid)
        });

        registry.register("GROUP_NOTES", |ctx, _arg| {
            ctx.db.parent_group(&ctx.entry.uuid)?.notes.clone()
        });

        for (name, format, utc) in [
            ("DT_SIMPLE", "%Y%m%d%H%M%S", false),
            ("DT_YEAR", "%Y", false),
            ("DT_MONTH", "%m", false),
            ("DT_DAY", "%d", false),
            ("DT_HOUR", "%H", false),
            ("DT_MINUTE", "%M", false),
            ("DT_SECOND", "%S", false),
            ("DT_UTC_SIMPLE", "%Y%m%d%H%M%S", true),
            ("DT_UTC_YEAR", "%Y", true),
            ("DT_UTC_MONTH", "%m", true),
            ("DT_UTC_DAY", "%d", true),
            ("DT_UTC_HOUR", "%H", true),
            ("DT_UTC_MINUTE", "%M", true),
            ("DT_UTC_SECOND", "%S", true),
        ] {
            registry.register(name, move |_ctx, _arg| {
                let formatted = if utc {
                    chrono::Utc::now().format(format).to_string()
                } else {
                    chrono::Local::now().format(format).to_string()
                };
                Some(formatted)
            });
        }

        registry.register("ENV:", |_ctx, arg| std::env::var(arg?).ok());

        // comments expand to nothing
        registry.register("C:", |_ctx, _arg| Some(String::new()));

        registry
    }
}

fn url_component(raw: &str, component: &str) -> Option<String> {
    let parsed = url::Url::parse(raw).ok()?;

    match component.to_uppercase().as_str() {
        "SCM" => Some(parsed.scheme().to_string()),
        "HOST" => parsed.host_str().map(str::to_string),
        "PORT" => parsed.port_or_known_default().map(|p| p.to_string()),
        "PATH" => Some(parsed.path().to_string()),
        "QUERY" => Some(parsed.query().unwrap_or("").to_string()),
        "FRAGMENT" => Some(parsed.fragment().unwrap_or("").to_string()),
        "USERINFO" => {
            let username = parsed.username();
            match parsed.password() {
                Some(password) => Some(format!("{}:{}", username, password)),
                None => Some(username.to_string()),
            }
        }
        "USERNAME" => Some(parsed.username().to_string()),
        "PASSWORD" => Some(parsed.password().unwrap_or("").to_string()),
        "RMVSCM" => {
            let without = raw
                .strip_prefix(&format!("{}://", parsed.scheme()))
                .or_else(|| raw.strip_prefix(&format!("{}:", parsed.scheme())))
                .unwrap_or(raw);
            Some(without.to_string())
        }
        _ => None,
    }
}

/// Expand all placeholders in `text`, in the context of `entry`
pub fn expand(db: &Database, entry: &Entry, text: &str, registry: &PlaceholderRegistry) -> String {
    let mut depths: HashMap<String, usize> = HashMap::new();
    let expanded = expand_tokens(db, entry, text, registry, &mut depths);
    expand_env_vars(&expanded)
}

fn expand_tokens(
    db: &Database,
    entry: &Entry,
    text: &str,
    registry: &PlaceholderRegistry,
    depths: &mut HashMap<String, usize>,
) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some((start, end)) = next_token(rest) {
        out.push_str(&rest[..start]);
        let token = &rest[start + 1..end];
        rest = &rest[end + 1..];

        match resolve_token(db, entry, token, registry, depths) {
            Some(replacement) => out.push_str(&replacement),
            None => {
                // unknown placeholders stay verbatim
                out.push('{');
                out.push_str(token);
                out.push('}');
            }
        }
    }

    out.push_str(rest);
    out
}

/// Find the next `{...}` token, returning byte offsets of the braces. A `{`
/// before the closing brace restarts the token there.
fn next_token(text: &str) -> Option<(usize, usize)> {
    let bytes = text.as_bytes();
    let mut start = None;

    for (i, b) in bytes.iter().enumerate() {
        match b {
            b'{' => start = Some(i),
            b'}' => {
                if let Some(s) = start {
                    return Some((s, i));
                }
            }
            _ => {}
        }
    }

    None
}

fn resolve_token(
    db: &Database,
    entry: &Entry,
    token: &str,
    registry: &PlaceholderRegistry,
    depths: &mut HashMap<String, usize>,
) -> Option<String> {
    let (name, arg) = match token.find(':') {
        Some(pos) => (&token[..pos], Some(&token[pos + 1..])),
        None => (token, None),
    };

    let depth_key = name.to_uppercase();

    let depth = depths.entry(depth_key.clone()).or_insert(0);
    if *depth >= MAX_RECURSION_DEPTH {
        log::warn!("placeholder {{{}}} exceeded the recursion limit", name);
        return None;
    }
    *depth += 1;

    let resolved = resolve_token_inner(db, entry, token, name, arg, registry, depths);

    if let Some(depth) = depths.get_mut(&depth_key) {
        *depth -= 1;
    }

    resolved
}

fn resolve_token_inner(
    db: &Database,
    entry: &Entry,
    token: &str,
    name: &str,
    arg: Option<&str>,
    registry: &PlaceholderRegistry,
    depths: &mut HashMap<String, usize>,
) -> Option<String> {
    if name.eq_ignore_ascii_case("REF") {
        let (target, wanted) = resolve_reference(db, arg?)?;
        let raw = match wanted {
            'I' => format_uuid(&target.uuid, None),
            _ => field_value(target, wanted)?,
        };
        return Some(expand_tokens(db, target, &raw, registry, depths));
    }

    if name.eq_ignore_ascii_case("HMACOTP") || name.eq_ignore_ascii_case("TIMEOTP") {
        return match &registry.otp_provider {
            Some(provider) => provider(entry, &name.to_uppercase()),
            None => {
                log::warn!("no OTP provider registered for {{{}}}", name);
                Some(String::new())
            }
        };
    }

    let ctx = ExpandContext { db, entry };

    // names with an argument dispatch through their `NAME:` handler; a
    // colon inside a plain name (e.g. a literal brace expression) falls
    // back to an exact lookup
    let handler = match arg {
        Some(_) => registry
            .lookup(&format!("{}:", name))
            .or_else(|| registry.lookup(token)),
        None => registry.lookup(name),
    }?;

    let replacement = handler(&ctx, arg)?;
    Some(expand_tokens(db, entry, &replacement, registry, depths))
}

fn field_value(entry: &Entry, selector: char) -> Option<String> {
    let field = match selector {
        'T' => fields::TITLE,
        'U' => fields::USERNAME,
        'P' => fields::PASSWORD,
        'A' => fields::URL,
        'N' => fields::NOTES,
        _ => return None,
    };
    entry.get(field).map(str::to_string)
}

/// Resolve a `{REF:W@S:text}` body (everything after `REF:`) to the target
/// entry and the wanted-field selector
fn resolve_reference<'a>(db: &'a Database, body: &str) -> Option<(&'a Entry, char)> {
    let mut chars = body.chars();
    let wanted = chars.next()?.to_ascii_uppercase();
    if chars.next()? != '@' {
        return None;
    }
    let search_in = chars.next()?.to_ascii_uppercase();
    if chars.next()? != ':' {
        return None;
    }
    let text: &str = chars.as_str();

    if !matches!(wanted, 'T' | 'U' | 'P' | 'A' | 'N' | 'I') {
        return None;
    }

    let found = match search_in {
        'I' => {
            let uuid = parse_ref_uuid(text)?;
            db.current_entry(&uuid)
        }
        'O' => {
            // any non-standard string field
            first_entry(db, |candidate| {
                let other_fields: Vec<&str> = candidate
                    .fields
                    .keys()
                    .filter(|key| !fields::is_standard(key))
                    .map(|key| key.as_str())
                    .collect();

                if other_fields.is_empty() {
                    return false;
                }

                parse_simple_expression(text, QueryOp::Like, &other_fields).matches(candidate)
            })
        }
        'T' | 'U' | 'P' | 'A' | 'N' => {
            let field = match search_in {
                'T' => fields::TITLE,
                'U' => fields::USERNAME,
                'P' => fields::PASSWORD,
                'A' => fields::URL,
                'N' => fields::NOTES,
                _ => unreachable!(),
            };
            let query = parse_simple_expression(text, QueryOp::Like, &[field]);
            first_entry(db, |candidate| query.matches(candidate))
        }
        _ => None,
    }?;

    Some((found, wanted))
}

fn first_entry<'a>(db: &'a Database, mut predicate: impl FnMut(&Entry) -> bool) -> Option<&'a Entry> {
    db.root
        .deep_iter(IterOptions::default())
        .find_map(|node| match node {
            NodeRef::Entry(e) if predicate(e) => Some(e),
            _ => None,
        })
}

fn expand_env_vars(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;

    while let Some(start) = rest.find('%') {
        let after = &rest[start + 1..];
        let Some(len) = after.find('%') else {
            break;
        };

        let name = &after[..len];
        let is_name = !name.is_empty()
            && name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');

        if is_name {
            if let Ok(value) = std::env::var(name) {
                out.push_str(&rest[..start]);
                out.push_str(&value);
                rest = &after[len + 1..];
                continue;
            }
        }

        // not a variable; emit up to and including this '%' and move on
        out.push_str(&rest[..start + 1]);
        rest = after;
    }

    out.push_str(rest);
    out
}

/// Rewrite `{REF:W@I:uuid}` tokens that point at `old` to point at `new`.
///
/// Returns `None` when nothing changed.
pub(crate) fn rewrite_ref_tokens(text: &str, old: &Uuid, new: &Uuid) -> Option<String> {
    let mut out = String::with_capacity(text.len());
    let mut rest = text;
    let mut changed = false;

    while let Some((start, end)) = next_token(rest) {
        let token = &rest[start + 1..end];
        out.push_str(&rest[..start]);

        let rewritten = ref_token_pointing_at(token, old)
            .map(|wanted| format!("{{REF:{}@I:{}}}", wanted, format_uuid(new, None)));

        match rewritten {
            Some(replacement) => {
                out.push_str(&replacement);
                changed = true;
            }
            None => {
                out.push('{');
                out.push_str(token);
                out.push('}');
            }
        }

        rest = &rest[end + 1..];
    }

    if !changed {
        return None;
    }

    out.push_str(rest);
    Some(out)
}

/// If `token` is a `REF:W@I:uuid` body pointing at `target`, return the
/// wanted-field selector
fn ref_token_pointing_at(token: &str, target: &Uuid) -> Option<char> {
    let body = token
        .strip_prefix("REF:")
        .or_else(|| token.strip_prefix("ref:"))
        .or_else(|| token.strip_prefix("Ref:"))?;

    let mut chars = body.chars();
    let wanted = chars.next()?.to_ascii_uppercase();
    if chars.next()? != '@' {
        return None;
    }
    if chars.next()?.to_ascii_uppercase() != 'I' {
        return None;
    }
    if chars.next()? != ':' {
        return None;
    }

    if parse_ref_uuid(chars.as_str())? == *target {
        Some(wanted)
    } else {
        None
    }
}

#[cfg(test)]
mod placeholder_tests {
    use super::*;
    use crate::config::DatabaseConfig;
    use crate::db::{Database, Entry, Group};

    fn db_with_entry(entry: Entry) -> Database {
        let mut db = Database::new(DatabaseConfig::default());
        db.root.add_child(entry);
        db
    }

    fn expand_for(db: &Database, uuid: &uuid::Uuid, text: &str) -> String {
        let registry = PlaceholderRegistry::default();
        let entry = db.current_entry(uuid).unwrap();
        expand(db, entry, text, &registry)
    }

    #[test]
    fn standard_fields() {
        let mut entry = Entry::new();
        entry.set_unprotected(fields::TITLE, "My Bank");
        entry.set_unprotected(fields::USERNAME, "alice");
        entry.set_protected(fields::PASSWORD, "s3cr3t");
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        assert_eq!(
            expand_for(&db, &uuid, "{USERNAME} @ {TITLE}: {PASSWORD}"),
            "alice @ My Bank: s3cr3t"
        );

        // unknown placeholders stay verbatim
        assert_eq!(expand_for(&db, &uuid, "{NO_SUCH_THING}"), "{NO_SUCH_THING}");
    }

    #[test]
    fn custom_strings_and_comments() {
        let mut entry = Entry::new();
        entry.set_unprotected("Server", "db01.example.com");
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        assert_eq!(expand_for(&db, &uuid, "host={S:Server}"), "host=db01.example.com");
        assert_eq!(expand_for(&db, &uuid, "a{C:this is a comment}b"), "ab");
    }

    #[test]
    fn url_components() {
        let mut entry = Entry::new();
        entry.set_unprotected(
            fields::URL,
            "https://user:pw@example.com:8443/path/to?q=1#frag",
        );
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        assert_eq!(expand_for(&db, &uuid, "{URL:SCM}"), "https");
        assert_eq!(expand_for(&db, &uuid, "{URL:HOST}"), "example.com");
        assert_eq!(expand_for(&db, &uuid, "{URL:PORT}"), "8443");
        assert_eq!(expand_for(&db, &uuid, "{URL:PATH}"), "/path/to");
        assert_eq!(expand_for(&db, &uuid, "{URL:QUERY}"), "q=1");
        assert_eq!(expand_for(&db, &uuid, "{URL:FRAGMENT}"), "frag");
        assert_eq!(expand_for(&db, &uuid, "{URL:USERNAME}"), "user");
        assert_eq!(expand_for(&db, &uuid, "{URL:PASSWORD}"), "pw");
        assert_eq!(
            expand_for(&db, &uuid, "{URL:RMVSCM}"),
            "user:pw@example.com:8443/path/to?q=1#frag"
        );
    }

    #[test]
    fn group_placeholders() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut group = Group::new("Email");
        group.notes = Some("personal accounts".to_string());
        let mut entry = Entry::new();
        let uuid = entry.uuid;
        entry.set_unprotected(fields::TITLE, "x");
        group.add_child(entry);
        db.root.add_child(group);

        assert_eq!(expand_for(&db, &uuid, "{GROUP}"), "Email");
        assert_eq!(expand_for(&db, &uuid, "{GROUP_PATH}"), "Email");
        assert_eq!(expand_for(&db, &uuid, "{GROUP_NOTES}"), "personal accounts");
    }

    #[test]
    fn nested_expansion() {
        let mut entry = Entry::new();
        entry.set_unprotected(fields::USERNAME, "alice");
        entry.set_unprotected("Greeting", "hello {USERNAME}");
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        assert_eq!(expand_for(&db, &uuid, "{S:Greeting}!"), "hello alice!");
    }

    #[test]
    fn recursion_is_bounded() {
        let mut entry = Entry::new();
        // a value that expands to itself forever
        entry.set_unprotected("Loop", "{S:Loop}");
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        // must terminate, leaving the innermost token unexpanded
        let out = expand_for(&db, &uuid, "{S:Loop}");
        assert!(out.contains("{S:Loop}"));
    }

    #[test]
    fn environment_variables() {
        std::env::set_var("KDBX_DB_TEST_VAR", "resolved");

        let entry = Entry::new();
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        assert_eq!(expand_for(&db, &uuid, "%KDBX_DB_TEST_VAR%"), "resolved");
        assert_eq!(
            expand_for(&db, &uuid, "{ENV:KDBX_DB_TEST_VAR}"),
            "resolved"
        );
        assert_eq!(
            expand_for(&db, &uuid, "100% sure %NOT_A_REAL_VAR_12345%"),
            "100% sure %NOT_A_REAL_VAR_12345%"
        );
    }

    #[test]
    fn field_references() {
        let mut db = Database::new(DatabaseConfig::default());

        let mut bank = Entry::new();
        bank.set_unprotected(fields::TITLE, "Bank");
        bank.set_unprotected(fields::USERNAME, "alice");
        bank.set_protected(fields::PASSWORD, "p4ss");
        let bank_uuid = bank.uuid;
        db.root.add_child(bank);

        let mut other = Entry::new();
        other.set_unprotected(fields::TITLE, "Other");
        let other_uuid = other.uuid;
        db.root.add_child(other);

        // by UUID
        let by_uuid = format!("{{REF:P@I:{}}}", format_uuid(&bank_uuid, None));
        assert_eq!(expand_for(&db, &other_uuid, &by_uuid), "p4ss");

        // by title search
        assert_eq!(expand_for(&db, &other_uuid, "{REF:U@T:Bank}"), "alice");

        // resolving the UUID field formats it
        assert_eq!(
            expand_for(&db, &other_uuid, "{REF:I@T:Bank}"),
            format_uuid(&bank_uuid, None)
        );

        // no match leaves the token verbatim
        assert_eq!(
            expand_for(&db, &other_uuid, "{REF:U@T:Nonexistent}"),
            "{REF:U@T:Nonexistent}"
        );
    }

    #[test]
    fn ref_token_rewriting() {
        let old = Uuid::from_bytes([1; 16]);
        let new = Uuid::from_bytes([2; 16]);

        let text = format!("pw is {{REF:P@I:{}}} here", format_uuid(&old, None));
        let rewritten = rewrite_ref_tokens(&text, &old, &new).unwrap();
        assert_eq!(
            rewritten,
            format!("pw is {{REF:P@I:{}}} here", format_uuid(&new, None))
        );

        // other tokens and other uuids are untouched
        assert!(rewrite_ref_tokens("{TITLE} {REF:P@T:Bank}", &old, &new).is_none());

        let other = Uuid::from_bytes([3; 16]);
        let text = format!("{{REF:P@I:{}}}", format_uuid(&other, None));
        assert!(rewrite_ref_tokens(&text, &old, &new).is_none());
    }

    #[test]
    fn custom_handlers() {
        let mut registry = PlaceholderRegistry::empty();
        registry.register("STATIC", |_ctx, _arg| Some("value".to_string()));

        let entry = Entry::new();
        let uuid = entry.uuid;
        let db = db_with_entry(entry);
        let entry = db.current_entry(&uuid).unwrap();

        assert_eq!(expand(&db, entry, "{STATIC}", &registry), "value");
        // default handlers are not present in an empty registry
        assert_eq!(expand(&db, entry, "{TITLE}", &registry), "{TITLE}");

        assert!(registry.unregister("STATIC"));
        assert!(!registry.unregister("STATIC"));

        assert_eq!(expand(&db, db.current_entry(&uuid).unwrap(), "{STATIC}", &registry), "{STATIC}");
    }

    #[test]
    fn otp_placeholders_use_provider() {
        let mut registry = PlaceholderRegistry::default();

        let entry = Entry::new();
        let uuid = entry.uuid;
        let db = db_with_entry(entry);

        // without a provider, OTP placeholders expand to empty
        assert_eq!(expand(&db, db.current_entry(&uuid).unwrap(), "{TIMEOTP}", &registry), "");

        registry.set_otp_provider(Box::new(|_entry, name| Some(format!("<{}>", name))));
        assert_eq!(
            expand(&db, db.current_entry(&uuid).unwrap(), "{TIMEOTP}", &registry),
            "<TIMEOTP>"
        );
        assert_eq!(
            expand(&db, db.current_entry(&uuid).unwrap(), "{HMACOTP}", &registry),
            "<HMACOTP>"
        );
    }
}

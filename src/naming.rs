// src/naming.rs

//! Name validation for databases, branches, tenants, and schema entities.
//!
//! This is the only place untrusted names are accepted; every path
//! helper assumes its inputs already passed [`validate_name`].

use crate::error::{Error, Result};

/// Maximum identifier length
pub const MAX_NAME_LEN: usize = 63;

/// Names rejected regardless of syntax (legacy device names)
const RESERVED_NAMES: [&str; 22] = [
    "con", "prn", "aux", "nul", "com1", "com2", "com3", "com4", "com5", "com6", "com7", "com8",
    "com9", "lpt1", "lpt2", "lpt3", "lpt4", "lpt5", "lpt6", "lpt7", "lpt8", "lpt9",
];

fn is_special(c: char) -> bool {
    c == '-' || c == '_'
}

/// Validate an identifier, failing with a precise reason.
///
/// `kind` names the entity being validated ("database", "branch",
/// "tenant", ...) and is included in error messages.
pub fn validate_name(name: &str, kind: &str) -> Result<()> {
    if name.is_empty() {
        return Err(Error::InvalidName(format!("{kind} name cannot be empty")));
    }
    if name.len() > MAX_NAME_LEN {
        return Err(Error::InvalidName(format!(
            "{kind} name cannot exceed {MAX_NAME_LEN} characters"
        )));
    }

    // Traversal sequences are checked before the character set so the
    // error names the actual attack rather than a stray character.
    if name.contains("..") || name.contains('/') || name.contains('\\') {
        return Err(Error::InvalidName(format!(
            "{kind} name contains a path traversal sequence"
        )));
    }

    if name.chars().any(|c| c.is_ascii_uppercase()) {
        let suggestion = clean_name(name);
        return Err(Error::InvalidName(format!(
            "{kind} name must be lowercase. Use '{suggestion}' instead"
        )));
    }

    for c in name.chars() {
        if !(c.is_ascii_lowercase() || c.is_ascii_digit() || is_special(c)) {
            return Err(Error::InvalidName(format!(
                "{kind} name contains invalid character {c:?} (allowed: a-z, 0-9, '-', '_')"
            )));
        }
    }

    let first = name.chars().next().unwrap_or('-');
    let last = name.chars().next_back().unwrap_or('-');
    if is_special(first) || is_special(last) {
        return Err(Error::InvalidName(format!(
            "{kind} name must start and end with an alphanumeric character"
        )));
    }

    let mut prev_special = false;
    for c in name.chars() {
        if is_special(c) {
            if prev_special {
                return Err(Error::InvalidName(format!(
                    "{kind} name contains consecutive special characters"
                )));
            }
            prev_special = true;
        } else {
            prev_special = false;
        }
    }

    if RESERVED_NAMES.contains(&name) {
        return Err(Error::InvalidName(format!(
            "'{name}' is a reserved name and cannot be used for a {kind}"
        )));
    }

    Ok(())
}

/// Check validity without an error reason
pub fn is_valid_name(name: &str, kind: &str) -> bool {
    validate_name(name, kind).is_ok()
}

/// Best-effort cleanup of an arbitrary string into a likely-valid name.
///
/// The result is a *suggestion* for the user and must be re-validated
/// before use; cleaning can still produce an empty or reserved string.
pub fn clean_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut prev_special = false;

    for c in name.chars() {
        let mapped = if c.is_whitespace() {
            Some('-')
        } else {
            let lower = c.to_ascii_lowercase();
            if lower.is_ascii_lowercase() || lower.is_ascii_digit() || is_special(lower) {
                Some(lower)
            } else {
                None
            }
        };

        if let Some(m) = mapped {
            if is_special(m) {
                if !prev_special && !out.is_empty() {
                    out.push(m);
                }
                prev_special = true;
            } else {
                out.push(m);
                prev_special = false;
            }
        }
    }

    while out.ends_with(|c: char| is_special(c)) {
        out.pop();
    }
    out
}

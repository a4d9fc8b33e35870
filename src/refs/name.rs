use crate::error::{Error, Result};

/// check a ref name against git's `check-ref-format` rules
///
/// top-level names are limited to upper case and `_` (`HEAD`,
/// `ORIG_HEAD`, ...); everything else lives under `refs/`.
pub fn validate_ref_name(name: &str) -> Result<()> {
    let invalid = |why: &str| Err(Error::InvalidRef(format!("{name}: {why}")));

    if name.is_empty() {
        return invalid("empty ref name");
    }
    if name == "@" {
        return invalid("'@' alone is not a ref");
    }

    if !name.contains('/') {
        if name.bytes().all(|b| b.is_ascii_uppercase() || b == b'_') {
            return Ok(());
        }
        return invalid("top-level refs must be upper case");
    }
    if !name.starts_with("refs/") {
        return invalid("must start with refs/");
    }

    if name.ends_with('/') {
        return invalid("cannot end with '/'");
    }
    if name.ends_with('.') {
        return invalid("cannot end with '.'");
    }
    if name.contains("..") {
        return invalid("cannot contain '..'");
    }
    if name.contains("@{") {
        return invalid("cannot contain '@{'");
    }
    if let Some(c) = name
        .chars()
        .find(|&c| c.is_ascii_control() || matches!(c, ' ' | '~' | '^' | ':' | '?' | '*' | '[' | '\\'))
    {
        return invalid(&format!("cannot contain {c:?}"));
    }

    for component in name.split('/') {
        if component.is_empty() {
            return invalid("empty path component");
        }
        if component.starts_with('.') {
            return invalid("components cannot start with '.'");
        }
        if component.ends_with(".lock") {
            return invalid("components cannot end with '.lock'");
        }
    }
    Ok(())
}

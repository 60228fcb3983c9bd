//! Per-command request handlers. Each module parses its command's
//! parameter block, performs the operation through the session, state, and
//! disk layers, and writes the reply block in place.

pub mod create;
pub mod file_ops;
pub mod io;
pub mod locking;
pub mod misc;
pub mod negotiate;
pub mod session_setup;
pub mod tree;

use crate::status::Status;

const INVALID_NAME_CHARS: &[char] = &['*', '?', '<', '>', '|', '"', ':'];

fn validate_component(part: &str) -> Result<(), Status> {
    if part.chars().any(|c| INVALID_NAME_CHARS.contains(&c) || (c as u32) < 0x20) {
        return Err(Status::OBJECT_NAME_INVALID);
    }
    Ok(())
}

/// Canonicalizes a client-supplied path: separators fold to backslash, a
/// leading separator anchors at the tree root, dot segments resolve, and
/// characters illegal in names are rejected.
pub fn canonicalize(raw: &str) -> Result<String, Status> {
    let mut parts: Vec<&str> = Vec::new();
    for part in raw.split(['\\', '/']) {
        match part {
            "" | "." => {}
            ".." => {
                if parts.pop().is_none() {
                    return Err(Status::OBJECT_PATH_SYNTAX_BAD);
                }
            }
            component => {
                validate_component(component)?;
                parts.push(component);
            }
        }
    }
    Ok(parts.join("\\"))
}

/// Canonicalizes a search path, returning the directory and the wildcard
/// pattern leaf separately (the leaf is the only place wildcards are
/// legal).
pub fn canonicalize_search(raw: &str) -> Result<(String, String), Status> {
    let trimmed = raw.trim_end_matches(['\\', '/']);
    let (dir, leaf) = match trimmed.rfind(['\\', '/']) {
        Some(at) => (&trimmed[..at], &trimmed[at + 1..]),
        None => ("", trimmed),
    };
    let dir = canonicalize(dir)?;
    if leaf.chars().any(|c| ['<', '>', '|', '"', ':'].contains(&c) || (c as u32) < 0x20) {
        return Err(Status::OBJECT_NAME_INVALID);
    }
    let pattern = if leaf.is_empty() { "*".to_string() } else { leaf.to_string() };
    Ok((dir, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_forms() {
        assert_eq!(canonicalize("\\hello.txt").unwrap(), "hello.txt");
        assert_eq!(canonicalize("docs\\sub\\..\\a.txt").unwrap(), "docs\\a.txt");
        assert_eq!(canonicalize("/mixed/slash\\style").unwrap(), "mixed\\slash\\style");
        assert_eq!(canonicalize("").unwrap(), "");
    }

    #[test]
    fn escapes_above_root_are_rejected() {
        assert_eq!(canonicalize("..\\secret"), Err(Status::OBJECT_PATH_SYNTAX_BAD));
        assert_eq!(canonicalize("a\\..\\..\\b"), Err(Status::OBJECT_PATH_SYNTAX_BAD));
    }

    #[test]
    fn wildcards_are_only_legal_in_search_leaves() {
        assert_eq!(canonicalize("docs\\*.txt"), Err(Status::OBJECT_NAME_INVALID));
        let (dir, pattern) = canonicalize_search("\\docs\\*.txt").unwrap();
        assert_eq!(dir, "docs");
        assert_eq!(pattern, "*.txt");
        let (dir, pattern) = canonicalize_search("\\docs\\").unwrap();
        assert_eq!(dir, "docs");
        assert_eq!(pattern, "*");
    }
}

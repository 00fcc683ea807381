//! Repository-relative path handling.
//!
//! Paths inside this crate are `/`-joined, carry no leading or trailing
//! slash and never contain `.` or `..` segments. The empty string names the
//! session root.

use crate::SvnError;

use std::borrow::Cow;
use std::cmp::Ordering;

/// Splits on `/` only: spaces, backslashes and colons are ordinary name
/// characters in a repository.
fn canonicalize(path: &str, allow_empty: bool) -> Result<Cow<'_, str>, SvnError> {
    if path.contains('\0') {
        return Err(SvnError::InvalidPath(format!("unsafe path: {path:?}")));
    }

    let trimmed = path.trim_matches('/');
    let mut parts: Vec<&str> = Vec::new();
    let mut rebuilt = false;
    for seg in trimmed.split('/') {
        match seg {
            "" | "." => rebuilt = true,
            ".." => return Err(SvnError::InvalidPath(format!("unsafe path: {path}"))),
            _ => parts.push(seg),
        }
    }

    if parts.is_empty() {
        if allow_empty {
            return Ok(Cow::Borrowed(""));
        }
        return Err(SvnError::InvalidPath("empty path".into()));
    }
    if !rebuilt {
        return Ok(Cow::Borrowed(trimmed));
    }
    Ok(Cow::Owned(parts.join("/")))
}

/// Canonicalizes a non-empty relative path.
pub(crate) fn validate_rel_path(path: &str) -> Result<String, SvnError> {
    Ok(canonicalize(path, false)?.into_owned())
}

/// Canonicalizes a relative path where `""` (the root) is allowed.
pub(crate) fn validate_rel_dir_path(path: &str) -> Result<String, SvnError> {
    Ok(canonicalize(path, true)?.into_owned())
}

pub(crate) fn validate_rel_dir_path_ref(path: &str) -> Result<Cow<'_, str>, SvnError> {
    canonicalize(path, true)
}

/// Joins two canonical relative paths.
pub(crate) fn join(parent: &str, child: &str) -> String {
    match (parent.is_empty(), child.is_empty()) {
        (true, _) => child.to_string(),
        (_, true) => parent.to_string(),
        _ => format!("{parent}/{child}"),
    }
}

/// Parent of a canonical path; the parent of a top-level entry is `""`.
pub(crate) fn dirname(path: &str) -> &str {
    path.rfind('/').map_or("", |idx| &path[..idx])
}

/// Last segment of a canonical path.
pub(crate) fn basename(path: &str) -> &str {
    path.rfind('/').map_or(path, |idx| &path[idx + 1..])
}

/// `true` when `path` is `ancestor` or lies below it.
pub(crate) fn is_ancestor(ancestor: &str, path: &str) -> bool {
    ancestor.is_empty()
        || path == ancestor
        || (path.starts_with(ancestor) && path.as_bytes().get(ancestor.len()) == Some(&b'/'))
}

/// Strips `ancestor` from `path`, returning the remainder relative to it.
pub(crate) fn skip_ancestor<'a>(ancestor: &str, path: &'a str) -> Option<&'a str> {
    if ancestor.is_empty() {
        return Some(path);
    }
    if path == ancestor {
        return Some("");
    }
    path.strip_prefix(ancestor)?.strip_prefix('/')
}

/// Orders paths as a depth-first pre-order walk would visit them.
///
/// Segments compare one at a time, so `a/b` sorts between `a` and `a-b`.
pub(crate) fn cmp_preorder(a: &str, b: &str) -> Ordering {
    let segs = |p: &str| -> Vec<String> {
        if p.is_empty() {
            Vec::new()
        } else {
            p.split('/').map(str::to_string).collect()
        }
    };
    segs(a).cmp(&segs(b))
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;

    #[test]
    fn validate_rel_path_rejects_empty_path() {
        let err = validate_rel_path("//").unwrap_err();
        assert!(matches!(err, SvnError::InvalidPath(_)));
        assert!(validate_rel_path("a\0b").is_err());
    }

    #[test]
    fn validate_rel_path_rejects_parent_dir() {
        assert!(validate_rel_path("../a.txt").is_err());
        assert!(validate_rel_path("a/../b.txt").is_err());
        assert!(validate_rel_dir_path("a/..").is_err());
    }

    #[test]
    fn validate_rel_path_normalizes_separators_and_curdir() {
        assert_eq!(validate_rel_path("/trunk/a.txt").unwrap(), "trunk/a.txt");
        assert_eq!(validate_rel_path("trunk/").unwrap(), "trunk");
        assert_eq!(
            validate_rel_path("//trunk//./a.txt").unwrap(),
            "trunk/a.txt"
        );
        assert_eq!(validate_rel_path("trunk/sub/./a.txt").unwrap(), "trunk/sub/a.txt");
    }

    #[test]
    fn names_keep_spaces_and_backslashes() {
        assert_eq!(validate_rel_path("a ").unwrap(), "a ");
        assert_eq!(validate_rel_path(" lead/x").unwrap(), " lead/x");
        assert_eq!(validate_rel_path("a\\b").unwrap(), "a\\b");
        assert_eq!(validate_rel_path("dir/c:d").unwrap(), "dir/c:d");
        assert_eq!(validate_rel_dir_path(" ").unwrap(), " ");
    }

    #[test]
    fn validate_rel_dir_path_allows_root() {
        assert_eq!(validate_rel_dir_path("").unwrap(), "");
        assert_eq!(validate_rel_dir_path("/").unwrap(), "");
        assert_eq!(validate_rel_dir_path_ref("trunk").unwrap(), "trunk");
    }

    #[test]
    fn join_and_split() {
        assert_eq!(join("", "a"), "a");
        assert_eq!(join("a", ""), "a");
        assert_eq!(join("a/b", "c"), "a/b/c");
        assert_eq!(dirname("a/b/c"), "a/b");
        assert_eq!(dirname("a"), "");
        assert_eq!(basename("a/b/c"), "c");
        assert_eq!(basename("a"), "a");
    }

    #[test]
    fn ancestry() {
        assert!(is_ancestor("", "a/b"));
        assert!(is_ancestor("a", "a/b"));
        assert!(is_ancestor("a", "a"));
        assert!(!is_ancestor("a", "ab"));
        assert_eq!(skip_ancestor("a", "a/b/c"), Some("b/c"));
        assert_eq!(skip_ancestor("a", "a"), Some(""));
        assert_eq!(skip_ancestor("a", "ab"), None);
        assert_eq!(skip_ancestor("", "x"), Some("x"));
    }

    #[test]
    fn preorder_keeps_subtrees_contiguous() {
        let mut paths = vec!["a-b", "a/b", "", "a", "a/b/c", "b"];
        paths.sort_by(|a, b| cmp_preorder(a, b));
        assert_eq!(paths, vec!["", "a", "a/b", "a/b/c", "a-b", "b"]);
    }
}

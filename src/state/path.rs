//! Dot-path parsing
//!
//! `"heat.current"` addresses `root["heat"]["current"]`.

use crate::error::PathError;

/// Split a dot-path into segments, rejecting empty ones
pub fn segments(path: &str) -> Result<Vec<&str>, PathError> {
    if path.is_empty() {
        return Err(PathError::Empty);
    }
    let parts: Vec<&str> = path.split('.').collect();
    if parts.iter().any(|s| s.is_empty()) {
        return Err(PathError::EmptySegment(path.to_string()));
    }
    Ok(parts)
}

/// Strict ancestors of a path, deepest first.
///
/// `"a.b.c"` yields `"a.b"`, then `"a"`.
pub fn ancestors(path: &str) -> impl Iterator<Item = &str> {
    path.char_indices()
        .filter(|&(_, c)| c == '.')
        .map(|(i, _)| &path[..i])
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
}

/// Join a prefix and a suffix with a dot
pub fn join(prefix: &str, suffix: &str) -> String {
    if prefix.is_empty() {
        suffix.to_string()
    } else {
        format!("{prefix}.{suffix}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_segments() {
        assert_eq!(segments("heat.current").unwrap(), vec!["heat", "current"]);
        assert_eq!(segments("ethics").unwrap(), vec!["ethics"]);
        assert_eq!(segments(""), Err(PathError::Empty));
        assert!(matches!(segments("a..b"), Err(PathError::EmptySegment(_))));
        assert!(matches!(segments(".a"), Err(PathError::EmptySegment(_))));
    }

    #[test]
    fn test_ancestors_deepest_first() {
        let found: Vec<_> = ancestors("a.b.c.d").collect();
        assert_eq!(found, vec!["a.b.c", "a.b", "a"]);
        assert_eq!(ancestors("root").count(), 0);
    }
}

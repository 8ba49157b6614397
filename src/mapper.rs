//! Object key → local path mapping.

use std::path::{Path, PathBuf};

/// Longest key, in characters, that is mirrored locally.
pub const MAX_KEY_LENGTH: usize = 185;

/// Why a key was not given a local path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rejection {
    /// Outside every included prefix.
    NotIncluded,
    /// Ends with `/`; a folder placeholder rather than a file.
    DirectoryMarker,
    /// Absolute key (`/x`, `\x`, `C:x`).
    Rooted,
    TooLong,
    /// Contains a `..` component.
    Traversal,
}

impl Rejection {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotIncluded => "not included",
            Self::DirectoryMarker => "directory marker",
            Self::Rooted => "rooted key",
            Self::TooLong => "key too long",
            Self::Traversal => "path traversal",
        }
    }
}

impl std::fmt::Display for Rejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of mapping one key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PathDecision {
    Accepted(PathBuf),
    Rejected(Rejection),
}

impl PathDecision {
    /// The local path, if the key was accepted.
    pub fn local_path(self) -> Option<PathBuf> {
        match self {
            Self::Accepted(path) => Some(path),
            Self::Rejected(_) => None,
        }
    }
}

/// Maps object keys under a destination root, honouring included prefixes.
///
/// Pure: the same key always yields the same decision for a given mapper.
#[derive(Debug, Clone)]
pub struct PathMapper {
    /// Each entry is `"{prefix}/"`, ready for `starts_with`.
    included: Vec<String>,
    destination_root: PathBuf,
}

impl PathMapper {
    pub fn new(included_prefixes: &[String], destination_root: &Path) -> Self {
        let included = normalize_prefixes(included_prefixes)
            .into_iter()
            .map(|p| format!("{p}/"))
            .collect();
        Self {
            included,
            destination_root: destination_root.to_path_buf(),
        }
    }

    pub fn map(&self, key: &str) -> PathDecision {
        if !self.included.is_empty() && !self.included.iter().any(|p| key.starts_with(p)) {
            return PathDecision::Rejected(Rejection::NotIncluded);
        }
        if key.ends_with('/') {
            return PathDecision::Rejected(Rejection::DirectoryMarker);
        }
        if is_rooted(key) {
            return PathDecision::Rejected(Rejection::Rooted);
        }
        if key.chars().count() > MAX_KEY_LENGTH {
            return PathDecision::Rejected(Rejection::TooLong);
        }
        if key.split('/').any(|c| c == "..") {
            return PathDecision::Rejected(Rejection::Traversal);
        }

        // Join component-wise so the platform separator is used.
        let mut path = self.destination_root.clone();
        for component in key.split('/').filter(|c| !c.is_empty()) {
            path.push(component);
        }
        PathDecision::Accepted(path)
    }
}

/// Trim trailing slashes and drop empty prefixes.
pub fn normalize_prefixes(prefixes: &[String]) -> Vec<String> {
    prefixes
        .iter()
        .map(|p| p.trim_end_matches('/').to_string())
        .filter(|p| !p.is_empty())
        .collect()
}

fn is_rooted(key: &str) -> bool {
    if key.starts_with('/') || key.starts_with('\\') {
        return true;
    }
    let mut chars = key.chars();
    matches!(
        (chars.next(), chars.next()),
        (Some(drive), Some(':')) if drive.is_ascii_alphabetic()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mapper(included: &[&str]) -> PathMapper {
        let included: Vec<String> = included.iter().map(|s| s.to_string()).collect();
        PathMapper::new(&included, Path::new("/mirror"))
    }

    #[test]
    fn test_accepts_plain_key() {
        let decision = mapper(&[]).map("photos/2024/a.jpg");
        assert_eq!(
            decision,
            PathDecision::Accepted(PathBuf::from("/mirror/photos/2024/a.jpg"))
        );
    }

    #[test]
    fn test_included_prefix_required() {
        let m = mapper(&["photos"]);
        assert!(matches!(m.map("photos/a.jpg"), PathDecision::Accepted(_)));
        assert_eq!(
            m.map("videos/a.mp4"),
            PathDecision::Rejected(Rejection::NotIncluded)
        );
    }

    #[test]
    fn test_prefix_is_a_whole_component() {
        let m = mapper(&["photos"]);
        assert_eq!(
            m.map("photos-old/a.jpg"),
            PathDecision::Rejected(Rejection::NotIncluded)
        );
        assert_eq!(m.map("photos"), PathDecision::Rejected(Rejection::NotIncluded));
    }

    #[test]
    fn test_prefix_trailing_slash_normalised() {
        let m = mapper(&["photos/"]);
        assert!(matches!(m.map("photos/a.jpg"), PathDecision::Accepted(_)));
    }

    #[test]
    fn test_empty_prefixes_ignored() {
        let m = mapper(&["", "/"]);
        assert!(matches!(m.map("anything/a.jpg"), PathDecision::Accepted(_)));
    }

    #[test]
    fn test_directory_marker_rejected() {
        assert_eq!(
            mapper(&[]).map("a/"),
            PathDecision::Rejected(Rejection::DirectoryMarker)
        );
    }

    #[test]
    fn test_rooted_keys_rejected() {
        let m = mapper(&[]);
        for key in ["/etc/passwd", "\\share\\x", "C:temp.txt", "d:/x"] {
            assert_eq!(m.map(key), PathDecision::Rejected(Rejection::Rooted), "{key}");
        }
    }

    #[test]
    fn test_colon_later_in_key_is_fine() {
        assert!(matches!(
            mapper(&[]).map("logs/12:00.txt"),
            PathDecision::Accepted(_)
        ));
    }

    #[test]
    fn test_length_limit() {
        let m = mapper(&[]);
        let at_limit = "a".repeat(MAX_KEY_LENGTH);
        let over = "a".repeat(MAX_KEY_LENGTH + 1);
        assert!(matches!(m.map(&at_limit), PathDecision::Accepted(_)));
        assert_eq!(m.map(&over), PathDecision::Rejected(Rejection::TooLong));
    }

    #[test]
    fn test_length_counts_characters_not_bytes() {
        let key = "é".repeat(MAX_KEY_LENGTH);
        assert!(key.len() > MAX_KEY_LENGTH);
        assert!(matches!(mapper(&[]).map(&key), PathDecision::Accepted(_)));
    }

    #[test]
    fn test_traversal_rejected() {
        let m = mapper(&[]);
        assert_eq!(
            m.map("photos/../../etc/passwd"),
            PathDecision::Rejected(Rejection::Traversal)
        );
        assert!(matches!(m.map("photos/..hidden"), PathDecision::Accepted(_)));
    }

    #[test]
    fn test_empty_components_collapsed() {
        assert_eq!(
            mapper(&[]).map("photos//a.jpg"),
            PathDecision::Accepted(PathBuf::from("/mirror/photos/a.jpg"))
        );
    }

    #[test]
    fn test_directory_marker_checked_before_length() {
        let key = format!("{}/", "a".repeat(MAX_KEY_LENGTH + 10));
        assert_eq!(
            mapper(&[]).map(&key),
            PathDecision::Rejected(Rejection::DirectoryMarker)
        );
    }

    #[test]
    fn test_mapping_is_deterministic() {
        let m = mapper(&["photos"]);
        for key in ["photos/a.jpg", "photos/", "x/y", "/abs"] {
            assert_eq!(m.map(key), m.map(key));
        }
    }

    #[test]
    fn test_local_path_helper() {
        assert!(mapper(&[]).map("a/").local_path().is_none());
        assert_eq!(
            mapper(&[]).map("a/b").local_path(),
            Some(PathBuf::from("/mirror/a/b"))
        );
    }
}

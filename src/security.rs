#![forbid(unsafe_code)]

//! Process and path guards shared by the grabtube binaries.

use std::path::{Component, Path, PathBuf};

use anyhow::{Result, bail};
use nix::unistd::Uid;

/// Refuses to start the process as root. Downloads land in user-owned
/// folders and the server may shell out to a file manager.
pub fn ensure_not_root(process: &str) -> Result<()> {
    ensure_not_root_for(Uid::current(), process)
}

fn ensure_not_root_for(uid: Uid, process: &str) -> Result<()> {
    if uid.is_root() {
        bail!("{process} must not be run as root; start it from a regular user account");
    }
    Ok(())
}

/// True when `value` is a single plain path component (no separators, no
/// `..`, not absolute, not empty).
pub fn is_safe_segment(value: &str) -> bool {
    if value.is_empty() {
        return false;
    }
    let mut components = Path::new(value).components();
    matches!(components.next(), Some(Component::Normal(_))) && components.next().is_none()
}

/// Joins a relative request path onto `root`, rejecting anything that could
/// climb out of it.
pub fn resolve_under(root: &Path, relative: &str) -> Option<PathBuf> {
    let trimmed = relative.trim_start_matches('/');
    if trimmed.is_empty() {
        return None;
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return None;
    }
    Some(root.join(candidate))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::unistd::Uid;

    #[test]
    fn ensure_not_root_allows_unprivileged_uid() {
        assert!(ensure_not_root_for(Uid::from_raw(1000), "tester").is_ok());
    }

    #[test]
    fn ensure_not_root_rejects_root_uid() {
        let err = ensure_not_root_for(Uid::from_raw(0), "tester").unwrap_err();
        assert!(err.to_string().contains("must not be run as root"));
    }

    #[test]
    fn safe_segments() {
        assert!(is_safe_segment("My Video.mp4"));
        assert!(is_safe_segment("视频.mp4"));
        assert!(!is_safe_segment(""));
        assert!(!is_safe_segment(".."));
        assert!(!is_safe_segment("../secret"));
        assert!(!is_safe_segment("a/b.mp4"));
        assert!(!is_safe_segment("/etc/passwd"));
    }

    #[test]
    fn resolve_under_rejects_traversal() {
        let root = Path::new("/srv/downloads");
        assert_eq!(
            resolve_under(root, "/clip.mp4"),
            Some(PathBuf::from("/srv/downloads/clip.mp4"))
        );
        assert_eq!(
            resolve_under(root, "nested/clip.mp4"),
            Some(PathBuf::from("/srv/downloads/nested/clip.mp4"))
        );
        assert_eq!(resolve_under(root, "../clip.mp4"), None);
        assert_eq!(resolve_under(root, ""), None);
    }
}

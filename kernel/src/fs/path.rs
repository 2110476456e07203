//! Path resolution: a stateless slash-delimited tokenizer plus a
//! mount-aware component walk that crosses mount-point boundaries and
//! consults the dentry cache instead of a fresh `readdir` scan per
//! component.

use crate::error::{KError, KResult};
use crate::fs::dentry::{self, DentryRef};
use crate::fs::mount;

/// Resolves an absolute path to its dentry, incrementing its ref count.
/// `vfs_lookup("/")` returns the root dentry of the longest-matching
/// mount directly.
pub fn vfs_lookup(path: &str) -> KResult<DentryRef> {
    if !path.starts_with('/') {
        return Err(KError::InvalidArgument);
    }
    vfs_resolve_path(path)
}

pub fn vfs_resolve_path(path: &str) -> KResult<DentryRef> {
    let (sb, remainder) = mount::resolve_mount(path)?;
    let mut current = mount::root_dentry_of(&sb)?;
    current = dentry::dget(&current);

    if remainder.is_empty() {
        return Ok(current);
    }

    for component in remainder.split('/').filter(|c| !c.is_empty()) {
        let next = dentry::dentry_lookup(&current, &sb, component)?;
        dentry::dput(current);
        current = next;
    }
    Ok(current)
}

/// Splits `path` into `(parent_path, basename)` for create/unlink-style
/// operations. `/foo/bar` -> `("/foo", "bar")`; `/bar` -> `("/", "bar")`.
pub fn split_parent(path: &str) -> KResult<(alloc::string::String, alloc::string::String)> {
    if !path.starts_with('/') || path == "/" {
        return Err(KError::InvalidArgument);
    }
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => Ok((alloc::string::String::from("/"), trimmed[1..].into())),
        Some(idx) => Ok((trimmed[..idx].into(), trimmed[idx + 1..].into())),
        None => Err(KError::InvalidArgument),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_parent_top_level() {
        let (parent, name) = split_parent("/dev").unwrap();
        assert_eq!(parent, "/");
        assert_eq!(name, "dev");
    }

    #[test]
    fn split_parent_nested() {
        let (parent, name) = split_parent("/dev/console").unwrap();
        assert_eq!(parent, "/dev");
        assert_eq!(name, "console");
    }

    #[test]
    fn split_parent_rejects_root() {
        assert!(split_parent("/").is_err());
    }
}

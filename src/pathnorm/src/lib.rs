//! Path normalization for trace records.
//!
//! Every path that enters the trace must be absolute and canonical, i.e.
//! `.`/`..` collapsed and symlinks resolved. The one deliberate exception to
//! plain canonicalization is the missing-leaf rule: `creat` and
//! `open(O_CREAT)` must be traceable for files that do not exist yet, so a
//! path whose final component is missing normalizes to its canonical parent
//! plus the literal new name.

use std::ffi::{OsStr, OsString};
use std::io;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NormalizeError {
    #[error("invalid argument")]
    InvalidArgument,
    #[error("path name too long")]
    NameTooLong,
    #[error("no such file or directory")]
    NotFound,
    #[error("too many levels of symbolic links")]
    Loop,
    #[error("permission denied")]
    AccessDenied,
    #[error("not a directory")]
    NotADirectory,
    #[error("i/o error")]
    Io,
}

impl NormalizeError {
    fn from_io(err: &io::Error) -> NormalizeError {
        match err.raw_os_error() {
            Some(libc::ENOENT) => NormalizeError::NotFound,
            Some(libc::ELOOP) => NormalizeError::Loop,
            Some(libc::EACCES) => NormalizeError::AccessDenied,
            Some(libc::ENOTDIR) => NormalizeError::NotADirectory,
            Some(libc::ENAMETOOLONG) => NormalizeError::NameTooLong,
            Some(libc::EINVAL) => NormalizeError::InvalidArgument,
            _ => NormalizeError::Io,
        }
    }
}

/// Combine a parent directory with an extra path fragment and canonicalize
/// the result.
///
/// An absolute `extra` ignores `parent` entirely. The join inserts exactly
/// one `/` of its own and never collapses separators already embedded in
/// either input. The intermediate path is bounded by `PATH_MAX`.
///
/// If canonicalization reports that only the final component is missing, the
/// canonical parent plus the stripped tail (verbatim) is returned instead;
/// any other failure is reported as-is.
pub fn combine(parent: Option<&OsStr>, extra: Option<&OsStr>) -> Result<PathBuf, NormalizeError> {
    let (parent, extra) = match (parent, extra) {
        (Some(p), Some(e)) => (p, e),
        _ => return Err(NormalizeError::InvalidArgument),
    };

    let parent = if extra.as_bytes().first() == Some(&b'/') {
        OsStr::new("")
    } else {
        parent
    };

    let mut joined = parent.as_bytes().to_vec();
    if extra.as_bytes().is_empty() {
        // an empty extra must not grow a trailing '/': re-normalizing an
        // already-normalized file path has to stay a no-op
        if joined.is_empty() {
            joined.push(b'/');
        }
    } else {
        if joined.last() != Some(&b'/') {
            joined.push(b'/');
        }
        joined.extend_from_slice(extra.as_bytes());
    }
    if joined.len() >= libc::PATH_MAX as usize {
        return Err(NormalizeError::NameTooLong);
    }

    let joined_path = PathBuf::from(OsString::from_vec(joined.clone()));
    match joined_path.canonicalize() {
        Ok(canonical) => Ok(canonical),
        Err(err) if err.raw_os_error() == Some(libc::ENOENT) => retry_without_leaf(&joined),
        Err(err) => Err(NormalizeError::from_io(&err)),
    }
}

/// The whole path was reported missing; accept it as long as its parent
/// directory exists. `joined` is absolute by construction.
fn retry_without_leaf(joined: &[u8]) -> Result<PathBuf, NormalizeError> {
    // back up over a single trailing '/', then find the start of the leaf
    let mut end = joined.len();
    if end > 0 && joined[end - 1] == b'/' {
        end -= 1;
    }
    let cut = joined[..end]
        .iter()
        .rposition(|&b| b == b'/')
        .unwrap_or(0);

    if cut == 0 {
        // stripping reached the root; '/' always exists, keep the rest verbatim
        return Ok(PathBuf::from(OsString::from_vec(joined.to_vec())));
    }

    let parent = Path::new(OsStr::from_bytes(&joined[..cut]));
    match parent.canonicalize() {
        Ok(mut canonical) => {
            canonical.push(OsStr::from_bytes(&joined[cut + 1..]));
            Ok(canonical)
        }
        Err(err) => Err(NormalizeError::from_io(&err)),
    }
}

/// The final path component, with trailing slashes and duplicate separators
/// ignored. `"/"` (and anything consisting only of slashes) maps to `"/"`.
pub fn basename(path: &OsStr) -> &OsStr {
    let bytes = path.as_bytes();
    let mut end = bytes.len();
    while end > 0 && bytes[end - 1] == b'/' {
        end -= 1;
    }
    if end == 0 {
        return OsStr::new("/");
    }
    let start = bytes[..end]
        .iter()
        .rposition(|&b| b == b'/')
        .map(|i| i + 1)
        .unwrap_or(0);
    OsStr::from_bytes(&bytes[start..end])
}

/// Whether `path` names a directory. Follows symlinks; a path that does not
/// exist is simply not a directory.
pub fn is_directory(path: &Path) -> bool {
    path.metadata().map(|m| m.is_dir()).unwrap_or(false)
}

/// Paths under `/dev`, `/proc` and `/sys` are kernel-made noise as far as a
/// build graph is concerned; events for them are suppressed.
pub fn is_system_path(path: &Path) -> bool {
    let bytes = path.as_os_str().as_bytes();
    bytes.starts_with(b"/dev/") || bytes.starts_with(b"/proc/") || bytes.starts_with(b"/sys/")
}

#[cfg(test)]
mod test {
    use super::*;
    use std::fs;
    use std::os::unix::fs::symlink;

    fn os(s: &str) -> &OsStr {
        OsStr::new(s)
    }

    fn combine_ok(parent: &str, extra: &str) -> PathBuf {
        combine(Some(os(parent)), Some(os(extra))).unwrap()
    }

    #[test]
    fn absolute_extra_ignores_parent() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        let abs = canon.join("f");
        fs::write(&abs, b"x").unwrap();

        let from_junk = combine(Some(os("/no/such/parent")), Some(abs.as_os_str())).unwrap();
        let from_root = combine(Some(os("/")), Some(abs.as_os_str())).unwrap();
        assert_eq!(from_junk, from_root);
        assert_eq!(from_junk, abs);
    }

    #[test]
    fn relative_extra_joins_parent() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        fs::create_dir(canon.join("sub")).unwrap();
        fs::write(canon.join("sub/f"), b"x").unwrap();

        assert_eq!(
            combine(Some(canon.as_os_str()), Some(os("sub/f"))).unwrap(),
            canon.join("sub/f")
        );
        // dot and dot-dot are resolved
        assert_eq!(
            combine(Some(canon.as_os_str()), Some(os("sub/./../sub/f"))).unwrap(),
            canon.join("sub/f")
        );
    }

    #[test]
    fn symlinks_are_resolved() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        fs::create_dir(canon.join("real")).unwrap();
        fs::write(canon.join("real/f"), b"x").unwrap();
        symlink(canon.join("real"), canon.join("alias")).unwrap();

        assert_eq!(
            combine(Some(canon.as_os_str()), Some(os("alias/f"))).unwrap(),
            canon.join("real/f")
        );
    }

    #[test]
    fn missing_leaf_keeps_literal_name() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();

        let combined = combine(Some(canon.as_os_str()), Some(os("brand-new"))).unwrap();
        assert_eq!(combined, canon.join("brand-new"));

        // the leaf is appended verbatim, even through a symlinked parent
        fs::create_dir(canon.join("real")).unwrap();
        symlink(canon.join("real"), canon.join("alias")).unwrap();
        let combined = combine(Some(canon.as_os_str()), Some(os("alias/new"))).unwrap();
        assert_eq!(combined, canon.join("real/new"));
    }

    #[test]
    fn missing_parent_is_still_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        assert_eq!(
            combine(Some(canon.as_os_str()), Some(os("no/such/dir/f"))),
            Err(NormalizeError::NotFound)
        );
    }

    #[test]
    fn root_rooted_leaf_always_succeeds() {
        assert_eq!(
            combine_ok("/", "no-such-file-anywhere"),
            PathBuf::from("/no-such-file-anywhere")
        );
    }

    #[test]
    fn file_component_used_as_directory() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        fs::write(canon.join("plain"), b"x").unwrap();
        assert_eq!(
            combine(Some(canon.as_os_str()), Some(os("plain/under"))),
            Err(NormalizeError::NotADirectory)
        );
    }

    #[test]
    fn null_inputs_are_invalid() {
        assert_eq!(
            combine(None, Some(os("/x"))),
            Err(NormalizeError::InvalidArgument)
        );
        assert_eq!(
            combine(Some(os("/")), None),
            Err(NormalizeError::InvalidArgument)
        );
        assert_eq!(combine(None, None), Err(NormalizeError::InvalidArgument));
    }

    #[test]
    fn over_long_joins_are_rejected() {
        let long = "a".repeat(libc::PATH_MAX as usize);
        assert_eq!(
            combine(Some(os("/tmp")), Some(os(&long))),
            Err(NormalizeError::NameTooLong)
        );
    }

    #[test]
    fn normalization_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let canon = dir.path().canonicalize().unwrap();
        fs::write(canon.join("f"), b"x").unwrap();

        let once = combine(Some(canon.as_os_str()), Some(os("f"))).unwrap();
        let twice = combine(Some(once.as_os_str()), Some(os(""))).unwrap();
        assert_eq!(once, twice);
    }

    #[test]
    fn basename_properties() {
        assert_eq!(basename(os("/a/b/c")), os("c"));
        assert_eq!(basename(os("/a/b/c/")), os("c"));
        assert_eq!(basename(os("/a//b//")), os("b"));
        assert_eq!(basename(os("rel")), os("rel"));
        assert_eq!(basename(os("/")), os("/"));
        assert_eq!(basename(os("///")), os("/"));
    }

    #[test]
    fn system_path_prefixes() {
        assert!(is_system_path(Path::new("/dev/null")));
        assert!(is_system_path(Path::new("/proc/self/exe")));
        assert!(is_system_path(Path::new("/sys/kernel")));
        assert!(!is_system_path(Path::new("/devices")));
        assert!(!is_system_path(Path::new("/home/u/proc/x")));
    }

    #[test]
    fn is_directory_on_missing_path_is_false() {
        assert!(is_directory(Path::new("/")));
        assert!(!is_directory(Path::new("/no/such/path/at/all")));
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("f"), b"x").unwrap();
        assert!(!is_directory(&dir.path().join("f")));
    }
}

// Source path resolution
// DWARF records build-tree paths; when a source prefix is configured, chop
// leading components off the recorded path until something readable shows up
// under the prefix.

use crate::{ProbeError, Result};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Check that `path` is readable, surfacing the open error otherwise.
fn readable(path: &Path) -> std::io::Result<()> {
    File::open(path).map(|_| ())
}

/// Errors worth retrying with a shorter suffix; anything else is a hard
/// failure of the candidate path itself.
fn retryable(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::ENOENT | libc::ENAMETOOLONG | libc::EROFS | libc::EFAULT)
    )
}

/// Resolve a raw DWARF source path to a readable on-disk path.
///
/// Without a prefix the raw path must be readable as-is. With a prefix,
/// `prefix/suffix` is probed repeatedly, stripping the leading component of
/// the suffix after each miss; every retry strictly shortens the suffix, so
/// the loop terminates.
pub(crate) fn get_real_path(raw_path: &str, source_prefix: Option<&Path>) -> Result<PathBuf> {
    let Some(prefix) = source_prefix else {
        return match readable(Path::new(raw_path)) {
            Ok(()) => Ok(PathBuf::from(raw_path)),
            Err(e) => Err(e.into()),
        };
    };

    let mut suffix = raw_path;
    loop {
        let candidate = format!("{}/{}", prefix.display(), suffix);
        match readable(Path::new(&candidate)) {
            Ok(()) => return Ok(PathBuf::from(candidate)),
            Err(e) if retryable(&e) => {
                debug!("source path miss: {}", candidate);
                match suffix[1..].find('/') {
                    Some(pos) => suffix = &suffix[1 + pos..],
                    None => {
                        return Err(ProbeError::NotFound(format!(
                            "source file for '{}' under '{}'",
                            raw_path,
                            prefix.display()
                        )))
                    }
                }
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_no_prefix_requires_readable_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let resolved = get_real_path(file.path().to_str().unwrap(), None).unwrap();
        assert_eq!(resolved, file.path());

        let err = get_real_path("/no/such/file.c", None).unwrap_err();
        assert!(matches!(err, ProbeError::Io(_)));
    }

    #[test]
    fn test_prefix_strips_leading_components() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("kernel");
        fs::create_dir(&dir).unwrap();
        fs::write(dir.join("sched.c"), "int x;\n").unwrap();

        // The recorded build path has extra leading directories that do not
        // exist under the prefix.
        let resolved = get_real_path(
            "/build/tmp/linux/kernel/sched.c",
            Some(root.path()),
        )
        .unwrap();
        assert!(resolved.ends_with("kernel/sched.c"));
        assert!(resolved.starts_with(root.path()));
    }

    #[test]
    fn test_prefix_exhaustion_is_not_found() {
        let root = tempfile::tempdir().unwrap();
        let err = get_real_path("/build/other/file.c", Some(root.path())).unwrap_err();
        assert!(matches!(err, ProbeError::NotFound(_)));
    }
}

//! The optional pre-build scan (`-r`): everything already on disk before the
//! command runs is, by definition, source.

use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use anyhow::Context;
use tracebuf::TraceBuffer;
use tracefmt::{Event, EventKind};
use walkdir::WalkDir;

/// Emit one REGISTER record per regular file under `root`, attributed to the
/// driver (process number 0). Directories and symlinks are skipped. The walk
/// runs under a single master-lock acquisition.
pub(crate) fn register_source_tree(buffer: &TraceBuffer, root: &Path) -> anyhow::Result<()> {
    let mut guard = buffer.lock().context("couldn't lock the trace buffer")?;
    for entry in WalkDir::new(root) {
        // unreadable subtrees reduce coverage but shouldn't kill the build
        let Ok(entry) = entry else { continue };
        if !entry.file_type().is_file() {
            continue;
        }
        let Ok(path) = CString::new(entry.path().as_os_str().as_bytes().to_vec()) else {
            continue;
        };
        guard
            .write_event(&Event::Path {
                kind: EventKind::Register,
                process: 0,
                path,
            })
            .context("couldn't register a source file")?;
    }
    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use std::os::unix::fs::symlink;

    #[test]
    #[serial]
    fn registers_regular_files_only() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.c"), b"int main;").unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/b.h"), b"#pragma once").unwrap();
        symlink("a.c", dir.path().join("alias")).unwrap();

        let buffer = TraceBuffer::create_with_size(1 << 16).unwrap();
        register_source_tree(&buffer, dir.path()).unwrap();

        let events = tracefmt::parse_payload(buffer.fetch()).unwrap();
        let mut paths: Vec<String> = events
            .iter()
            .map(|ev| match ev {
                Event::Path {
                    kind: EventKind::Register,
                    process: 0,
                    path,
                } => path.to_str().unwrap().to_owned(),
                other => panic!("unexpected event {other:?}"),
            })
            .collect();
        paths.sort();
        assert_eq!(
            paths,
            vec![
                dir.path().join("a.c").display().to_string(),
                dir.path().join("sub/b.h").display().to_string(),
            ]
        );
    }
}

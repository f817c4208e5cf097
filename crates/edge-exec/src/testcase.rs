//! Testcase delivery to the target.
//!
//! Two modes, decided once at startup: the target either reads a named file
//! (it appeared as `@@` in its argument list, or was pinned with a flag), or
//! it reads stdin, in which case the forkserver child's fd 0 is a persistent
//! descriptor that gets rewound and truncated between runs.

use anyhow::{Context, Result};
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

pub enum TestcaseIo {
    /// The target opens `path` itself on every run.
    File { path: PathBuf },
    /// The target inherits `file` as stdin; rewind + truncate between runs.
    Stdin { file: File, path: PathBuf },
}

impl TestcaseIo {
    pub fn file(path: PathBuf) -> Self {
        TestcaseIo::File { path }
    }

    /// Open the persistent stdin-backing file (created fresh, 0600).
    pub fn stdin(path: PathBuf) -> Result<Self> {
        let _ = std::fs::remove_file(&path);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .mode(0o600)
            .open(&path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        Ok(TestcaseIo::Stdin { file, path })
    }

    /// Put `data` where the next run will find it.
    ///
    /// File mode recreates the file from scratch so a target that crashed
    /// mid-read never sees a partial leftover; stdin mode rewinds, rewrites
    /// and truncates the persistent descriptor.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self {
            TestcaseIo::File { path } => {
                let _ = std::fs::remove_file(&*path);
                let mut f = OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .mode(0o600)
                    .open(&*path)
                    .with_context(|| format!("unable to create '{}'", path.display()))?;
                f.write_all(data)
                    .with_context(|| format!("short write to '{}'", path.display()))?;
            }
            TestcaseIo::Stdin { file, path } => {
                file.seek(SeekFrom::Start(0))?;
                file.write_all(data)
                    .with_context(|| format!("short write to '{}'", path.display()))?;
                file.set_len(data.len() as u64)?;
                file.seek(SeekFrom::Start(0))?;
            }
        }
        Ok(())
    }

    /// Descriptor to wire into the child's stdin, if in stdin mode.
    pub fn stdin_fd(&self) -> Option<RawFd> {
        match self {
            TestcaseIo::File { .. } => None,
            TestcaseIo::Stdin { file, .. } => Some(file.as_raw_fd()),
        }
    }

    pub fn path(&self) -> &Path {
        match self {
            TestcaseIo::File { path } | TestcaseIo::Stdin { path, .. } => path,
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn test_file_mode_recreates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("case");
        let mut io = TestcaseIo::file(path.clone());

        io.write(b"first run").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"first run");

        io.write(b"x").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"x");

        io.write(b"").unwrap();
        assert_eq!(std::fs::read(&path).unwrap(), b"");
    }

    #[test]
    fn test_stdin_mode_rewinds_and_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".cur_input");
        let mut io = TestcaseIo::stdin(path.clone()).unwrap();

        io.write(b"a longer first input").unwrap();
        io.write(b"short").unwrap();

        // The backing file holds exactly the second input, positioned at 0.
        let TestcaseIo::Stdin { file, .. } = &mut io else {
            unreachable!()
        };
        let mut got = Vec::new();
        file.read_to_end(&mut got).unwrap();
        assert_eq!(got, b"short");
    }

    #[test]
    fn test_stdin_fd_only_in_stdin_mode() {
        let dir = tempfile::tempdir().unwrap();
        assert!(TestcaseIo::file(dir.path().join("f")).stdin_fd().is_none());
        let io = TestcaseIo::stdin(dir.path().join("s")).unwrap();
        assert!(io.stdin_fd().is_some());
    }
}

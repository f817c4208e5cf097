//! Output directory lifecycle.
//!
//! One directory per fuzzing instance, guarded by an exclusive advisory lock
//! on the directory fd for as long as the process lives. The subdirectory
//! layout follows the tool's lineage so downstream triage scripts keep
//! working, even though the agent loop itself only writes the top-level
//! stats and diagnostic files.

use anyhow::{bail, Context, Result};
use std::fs::{self, File};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::{Path, PathBuf};

const SUBDIRS: [&str; 3] = ["queue", "crashes", "hangs"];

#[derive(Debug)]
pub struct OutputDir {
    path: PathBuf,
    /// Keeps the flock alive; released when the process exits.
    lock: File,
}

impl OutputDir {
    pub fn create(path: &Path) -> Result<Self> {
        fs::create_dir_all(path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;

        let lock = File::open(path)
            .with_context(|| format!("unable to open '{}'", path.display()))?;
        // SAFETY: flock on a descriptor we own.
        if unsafe { libc::flock(lock.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            bail!(
                "output directory '{}' is locked by another instance",
                path.display()
            );
        }

        for sub in SUBDIRS {
            fs::create_dir_all(path.join(sub))
                .with_context(|| format!("unable to create '{}/{}'", path.display(), sub))?;
        }

        Ok(Self {
            path: path.to_path_buf(),
            lock,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn file(&self, name: &str) -> PathBuf {
        self.path.join(name)
    }

    /// Descriptor holding the lock — the forkserver child closes it.
    pub fn lock_fd(&self) -> RawFd {
        self.lock.as_raw_fd()
    }

    /// Default location for testcase delivery when no `-f` path was given.
    pub fn default_testcase_path(&self) -> PathBuf {
        self.path.join(".cur_input")
    }

    /// Dump the raw virgin map for offline coverage inspection.
    pub fn write_bitmap(&self, virgin: &[u8]) -> Result<()> {
        fs::write(self.file("fuzz_bitmap"), virgin)
            .with_context(|| format!("unable to write '{}'", self.file("fuzz_bitmap").display()))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creates_layout() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(&dir.path().join("out")).unwrap();
        for sub in SUBDIRS {
            assert!(out.path().join(sub).is_dir(), "{sub} missing");
        }
    }

    #[test]
    fn test_second_instance_is_locked_out() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out");
        let _first = OutputDir::create(&path).unwrap();
        let second = OutputDir::create(&path);
        assert!(second.is_err());
        assert!(second.unwrap_err().to_string().contains("locked"));
    }

    #[test]
    fn test_bitmap_dump() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(&dir.path().join("out")).unwrap();
        out.write_bitmap(&[0xff, 0x00, 0x7f]).unwrap();
        assert_eq!(
            fs::read(out.file("fuzz_bitmap")).unwrap(),
            vec![0xff, 0x00, 0x7f]
        );
    }
}

//! Target binary vetting and argv preparation.
//!
//! Catches the classic foot-guns before the forkserver ever spawns: shell
//! stubs, uninstrumented builds, binaries that only exist in `$PATH`'s
//! imagination. Also sniffs the signatures that change how the child is run
//! (ASAN/MSAN linkage, persistent mode, deferred forkserver).

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::SHM_ENV_VAR;

// Magic strings compiled into targets by the instrumentation toolchain. The
// trailing NUL is part of the signature.
const PERSIST_SIG: &[u8] = b"##SIG_AFL_PERSISTENT##\0";
const DEFER_SIG: &[u8] = b"##SIG_AFL_DEFER_FORKSRV##\0";

pub const PERSIST_ENV_VAR: &str = "__AFL_PERSISTENT";
pub const DEFER_ENV_VAR: &str = "__AFL_DEFER_FORKSRV";

pub struct TargetSpec {
    /// Resolved path to the target binary.
    pub path: PathBuf,
    /// Arguments after the binary, `@@` already substituted if applicable.
    pub args: Vec<String>,
    /// Emulator binary when running uninstrumented targets under QEMU.
    pub qemu: Option<PathBuf>,
    pub uses_asan: bool,
    pub persistent: bool,
    pub deferred: bool,
}

impl TargetSpec {
    pub fn new(binary: &str, args: Vec<String>, qemu_mode: bool) -> Result<Self> {
        let path = resolve(binary)?;
        let qemu = if qemu_mode { Some(find_qemu()?) } else { None };
        Ok(Self {
            path,
            args,
            qemu,
            uses_asan: false,
            persistent: false,
            deferred: false,
        })
    }

    /// Inspect the binary on disk. Rejects scripts, non-ELF files and
    /// uninstrumented builds (unless `skip_checks`), and records the
    /// ASAN/persistent/deferred signatures — the latter two are announced to
    /// the target through their environment variables.
    pub fn vet(&mut self, skip_checks: bool) -> Result<()> {
        if skip_checks {
            return Ok(());
        }

        if let Some(parent) = self.path.parent() {
            if parent == Path::new("/tmp") || parent == Path::new("/var/tmp") {
                bail!("please don't keep binaries in /tmp or /var/tmp");
            }
        }

        let data = std::fs::read(&self.path)
            .with_context(|| format!("unable to read '{}'", self.path.display()))?;

        if data.starts_with(b"#!") {
            bail!(
                "program '{}' is a shell script; point the fuzzer at the \
                 compiled binary instead",
                self.path.display()
            );
        }

        if !data.starts_with(&[0x7f, b'E', b'L', b'F']) {
            bail!("program '{}' is not an ELF binary", self.path.display());
        }

        let mut shm_sig = SHM_ENV_VAR.as_bytes().to_vec();
        shm_sig.push(0);
        let instrumented = contains(&data, &shm_sig);

        if self.qemu.is_none() && !instrumented {
            bail!(
                "no instrumentation detected in '{}'; rebuild with the \
                 instrumenting compiler wrapper, or use QEMU mode (-Q)",
                self.path.display()
            );
        }
        if self.qemu.is_some() && instrumented {
            bail!("instrumentation found in '{}' while in QEMU mode (-Q)", self.path.display());
        }

        if contains(&data, b"libasan.so") || contains(&data, b"__msan_init") {
            self.uses_asan = true;
        }

        if contains(&data, PERSIST_SIG) {
            info!("persistent mode binary detected");
            std::env::set_var(PERSIST_ENV_VAR, "1");
            self.persistent = true;
        }

        if contains(&data, DEFER_SIG) {
            info!("deferred forkserver binary detected");
            std::env::set_var(DEFER_ENV_VAR, "1");
            self.deferred = true;
        }

        Ok(())
    }

    /// Replace every `@@` argument with the testcase path. Returns whether
    /// anything was substituted — the caller switches to file-based delivery
    /// if so.
    pub fn substitute_file_args(&mut self, testcase: &Path) -> bool {
        let mut any = false;
        for arg in &mut self.args {
            if arg.contains("@@") {
                *arg = arg.replace("@@", &testcase.to_string_lossy());
                any = true;
            }
        }
        any
    }

    /// Full argv for `execve`, emulator first when in QEMU mode.
    pub fn exec_argv(&self) -> Result<Vec<CString>> {
        let mut argv = Vec::with_capacity(self.args.len() + 2);
        if let Some(qemu) = &self.qemu {
            argv.push(path_cstring(qemu)?);
        }
        argv.push(path_cstring(&self.path)?);
        for arg in &self.args {
            argv.push(CString::new(arg.as_bytes()).context("NUL byte in target argument")?);
        }
        Ok(argv)
    }

    /// Binary that actually gets exec'd (the emulator in QEMU mode).
    pub fn exec_path(&self) -> &Path {
        self.qemu.as_deref().unwrap_or(&self.path)
    }
}

fn path_cstring(path: &Path) -> Result<CString> {
    use std::os::unix::ffi::OsStrExt;
    CString::new(path.as_os_str().as_bytes()).context("NUL byte in path")
}

/// Resolve the target name: used verbatim when it contains a slash,
/// otherwise searched in `$PATH`. Must be an executable regular file.
fn resolve(binary: &str) -> Result<PathBuf> {
    let candidates: Vec<PathBuf> = if binary.contains('/') {
        vec![PathBuf::from(binary)]
    } else {
        std::env::var_os("PATH")
            .map(|p| std::env::split_paths(&p).map(|d| d.join(binary)).collect())
            .unwrap_or_default()
    };

    for cand in candidates {
        if is_executable_file(&cand) {
            return Ok(cand);
        }
    }
    bail!("program '{}' not found or not executable", binary);
}

fn is_executable_file(path: &Path) -> bool {
    match std::fs::metadata(path) {
        Ok(meta) => meta.is_file() && meta.len() >= 4 && meta.permissions().mode() & 0o111 != 0,
        Err(_) => false,
    }
}

/// Locate `afl-qemu-trace`: next to our own executable first, then `$PATH`.
fn find_qemu() -> Result<PathBuf> {
    if let Ok(me) = std::env::current_exe() {
        if let Some(dir) = me.parent() {
            let cand = dir.join("afl-qemu-trace");
            if is_executable_file(&cand) {
                return Ok(cand);
            }
        }
    }
    match resolve("afl-qemu-trace") {
        Ok(path) => Ok(path),
        Err(_) => {
            warn!("QEMU mode requested but afl-qemu-trace is not installed");
            bail!("unable to locate afl-qemu-trace for QEMU mode");
        }
    }
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    !needle.is_empty() && haystack.windows(needle.len()).any(|w| w == needle)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::os::unix::fs::OpenOptionsExt;

    fn write_exec(dir: &Path, name: &str, contents: &[u8]) -> PathBuf {
        let path = dir.join(name);
        let mut f = std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .mode(0o755)
            .open(&path)
            .unwrap();
        f.write_all(contents).unwrap();
        path
    }

    fn fake_elf(extra: &[u8]) -> Vec<u8> {
        let mut data = vec![0x7f, b'E', b'L', b'F'];
        data.extend_from_slice(&[0u8; 32]);
        data.extend_from_slice(extra);
        data
    }

    fn instrumented_elf(extra: &[u8]) -> Vec<u8> {
        let mut sig = SHM_ENV_VAR.as_bytes().to_vec();
        sig.push(0);
        sig.extend_from_slice(extra);
        fake_elf(&sig)
    }

    #[test]
    fn test_missing_binary_rejected() {
        assert!(TargetSpec::new("/nonexistent/target-bin", vec![], false).is_err());
    }

    #[test]
    fn test_shell_script_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exec(dir.path(), "stub", b"#!/bin/sh\nexec real\n");
        let mut spec = TargetSpec::new(path.to_str().unwrap(), vec![], false).unwrap();
        let err = spec.vet(false).unwrap_err();
        assert!(err.to_string().contains("shell script"));
    }

    #[test]
    fn test_uninstrumented_rejected_unless_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exec(dir.path(), "plain", &fake_elf(b"no magic here"));
        let mut spec = TargetSpec::new(path.to_str().unwrap(), vec![], false).unwrap();
        assert!(spec.vet(false).is_err());
        assert!(spec.vet(true).is_ok());
    }

    #[test]
    fn test_signature_detection() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exec(
            dir.path(),
            "asan",
            &instrumented_elf(b"...libasan.so..."),
        );
        let mut spec = TargetSpec::new(path.to_str().unwrap(), vec![], false).unwrap();
        spec.vet(false).unwrap();
        assert!(spec.uses_asan);
        assert!(!spec.persistent);
    }

    #[test]
    fn test_substitute_file_args() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exec(dir.path(), "t", &instrumented_elf(b""));
        let mut spec = TargetSpec::new(
            path.to_str().unwrap(),
            vec!["--in".into(), "@@".into(), "-v".into()],
            false,
        )
        .unwrap();
        assert!(spec.substitute_file_args(Path::new("/work/out/.cur_input")));
        assert_eq!(spec.args[1], "/work/out/.cur_input");
        assert_eq!(spec.args[2], "-v");

        let mut no_subst =
            TargetSpec::new(path.to_str().unwrap(), vec!["-v".into()], false).unwrap();
        assert!(!no_subst.substitute_file_args(Path::new("/x")));
    }

    #[test]
    fn test_exec_argv_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_exec(dir.path(), "t", &instrumented_elf(b""));
        let spec = TargetSpec::new(path.to_str().unwrap(), vec!["-a".into()], false).unwrap();
        let argv = spec.exec_argv().unwrap();
        assert_eq!(argv.len(), 2);
        assert_eq!(argv[0].to_bytes(), path.to_str().unwrap().as_bytes());
        assert_eq!(argv[1].to_bytes(), b"-a");
    }
}

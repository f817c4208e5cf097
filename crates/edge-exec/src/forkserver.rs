//! Forkserver executor.
//!
//! The target is exec'd exactly once; its injected runtime then sits in a
//! loop cloning stopped children on command. Each run is a three-message
//! dance over two pipes rigged to well-known descriptor numbers:
//!
//!   parent → ctl:  "previous run timed out?" (4 bytes)
//!   status → parent: child PID (4 bytes)
//!   status → parent: wait status (4 bytes)
//!
//! Timeouts never interrupt the status read. The armed SIGALRM handler kills
//! the running child instead, at which point the forkserver reports the
//! SIGKILL through the pipe like any other termination.
//!
//! Ordering within a run is load-bearing: telemetry zero → barrier →
//! ctl write → pid read → timer arm → status read → timer disarm → barrier.
//! The child writes the shared region asynchronously from the parent's point
//! of view; the two fences keep the parent's reads on the right side of the
//! protocol.

use anyhow::{bail, Context, Result};
use std::ffi::CString;
use std::fs::File;
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::os::unix::io::{AsRawFd, RawFd};
use std::sync::atomic::{fence, Ordering::SeqCst};
use tracing::info;

use crate::classify::classify_counts;
use crate::shmem::SharedTelemetry;
use crate::signals;
use crate::target::TargetSpec;
use crate::testcase::TestcaseIo;

/// Descriptor the child expects the control pipe on; status pipe is +1.
pub const FORKSRV_FD: RawFd = 198;

/// Signature the child plants in the first word of the coverage map when
/// `execve` falls through.
pub const EXEC_FAIL_SIG: u32 = 0xfee1_dead;

/// Handshake timeout multiplier over the per-run timeout.
pub const FORK_WAIT_MULT: u32 = 10;

/// Distinctive exit code MSAN is configured to use in place of aborting.
pub const MSAN_ERROR: i32 = 86;

/// How a single execution ended.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Fault {
    /// Ran to completion (including ordinary non-zero exits).
    None,
    /// Killed by our timer.
    Timeout,
    /// Died to a signal (or an MSAN error exit).
    Crash,
    /// The exec itself fell through.
    ExecFail,
}

pub struct ForkServer {
    pid: libc::pid_t,
    ctl_fd: RawFd,
    st_fd: RawFd,
    uses_asan: bool,
    prev_timed_out: bool,
    kill_signal: i32,
}

impl ForkServer {
    /// Spawn the forkserver and complete the four-byte handshake.
    ///
    /// `close_fds` lists parent descriptors (lock file, log files) the child
    /// must not inherit. The handshake is given `timeout_ms × FORK_WAIT_MULT`
    /// before it is declared dead.
    pub fn start(
        target: &TargetSpec,
        shm: &SharedTelemetry,
        testcase: &TestcaseIo,
        mem_limit_mb: Option<u64>,
        timeout_ms: u32,
        close_fds: &[RawFd],
    ) -> Result<Self> {
        info!("spinning up the fork server");

        let argv = target.exec_argv()?;
        let envp = build_envp();
        let exec_path = CString::new(target.exec_path().as_os_str().as_bytes())
            .context("NUL byte in target path")?;

        // Raw pointer arrays must exist before fork(); the child may not
        // allocate.
        let mut argv_ptrs: Vec<*const libc::c_char> =
            argv.iter().map(|a| a.as_ptr()).collect();
        argv_ptrs.push(std::ptr::null());
        let mut envp_ptrs: Vec<*const libc::c_char> =
            envp.iter().map(|e| e.as_ptr()).collect();
        envp_ptrs.push(std::ptr::null());

        let dev_null = File::options()
            .read(true)
            .write(true)
            .open("/dev/null")
            .context("unable to open /dev/null")?;

        let mut ctl_pipe = [0 as RawFd; 2];
        let mut st_pipe = [0 as RawFd; 2];
        // SAFETY: plain pipe(2); the arrays are sized for the two fds.
        unsafe {
            if libc::pipe(ctl_pipe.as_mut_ptr()) != 0 || libc::pipe(st_pipe.as_mut_ptr()) != 0 {
                bail!("pipe() failed: {}", io::Error::last_os_error());
            }
        }

        let child = ChildSetup {
            ctl_read: ctl_pipe[0],
            ctl_write: ctl_pipe[1],
            st_read: st_pipe[0],
            st_write: st_pipe[1],
            dev_null: dev_null.as_raw_fd(),
            stdin_fd: testcase.stdin_fd(),
            mem_limit_mb,
            shm_base: shm.base_ptr(),
            exec_path: exec_path.as_ptr(),
            argv: argv_ptrs.as_ptr(),
            envp: envp_ptrs.as_ptr(),
            close_fds,
        };

        // SAFETY: the child branch performs only async-signal-safe syscalls
        // on pre-materialized data and never returns.
        let pid = unsafe { libc::fork() };
        if pid < 0 {
            bail!("fork() failed: {}", io::Error::last_os_error());
        }
        if pid == 0 {
            unsafe { child.exec_or_die() };
        }

        // Parent: drop the child's ends, then wait for the hello.
        unsafe {
            libc::close(ctl_pipe[0]);
            libc::close(st_pipe[1]);
        }
        drop(dev_null);

        let fsrv = Self {
            pid,
            ctl_fd: ctl_pipe[1],
            st_fd: st_pipe[0],
            uses_asan: target.uses_asan,
            prev_timed_out: false,
            kill_signal: 0,
        };
        signals::set_forkserver_pid(pid);
        signals::set_child_pid(-1); // handshake phase: a timeout goes to the forkserver
        signals::clear_child_timed_out();

        signals::arm_timer(timeout_ms.saturating_mul(FORK_WAIT_MULT));
        let hello = read_u32(fsrv.st_fd);
        signals::disarm_timer();

        if hello.is_ok() {
            info!("all right - fork server is up");
            return Ok(fsrv);
        }

        if signals::child_timed_out() {
            bail!("timeout while initializing fork server (adjusting -t may help)");
        }

        let mut status: libc::c_int = 0;
        // SAFETY: pid is our direct child.
        if unsafe { libc::waitpid(pid, &mut status, 0) } <= 0 {
            bail!("waitpid() failed: {}", io::Error::last_os_error());
        }
        if libc::WIFSIGNALED(status) {
            bail!("fork server crashed with signal {}", libc::WTERMSIG(status));
        }
        if shm.first_word() == EXEC_FAIL_SIG {
            bail!("unable to execute target application '{}'", target.path.display());
        }
        bail!("fork server handshake failed (no hello received)");
    }

    /// Execute the current testcase once.
    ///
    /// On return the coverage map is classified and both maps are stable.
    /// A `stop` request observed mid-protocol yields `Fault::None`; the
    /// caller checks [`signals::stop_requested`] at its own boundaries.
    pub fn run(&mut self, shm: &mut SharedTelemetry, timeout_ms: u32) -> Result<Fault> {
        signals::clear_child_timed_out();

        shm.reset();
        fence(SeqCst);

        if let Err(err) = write_u32(self.ctl_fd, self.prev_timed_out as u32) {
            if signals::stop_requested() {
                return Ok(Fault::None);
            }
            bail!("unable to request new process from fork server (OOM?): {err}");
        }

        let child_pid = match read_u32(self.st_fd) {
            Ok(v) => v as libc::pid_t,
            Err(_) if signals::stop_requested() => return Ok(Fault::None),
            Err(err) => bail!("unable to read child PID from fork server: {err}"),
        };
        if child_pid <= 0 {
            bail!("fork server is misbehaving (OOM?)");
        }
        signals::set_child_pid(child_pid);

        signals::arm_timer(timeout_ms);
        let status = match read_u32(self.st_fd) {
            Ok(v) => v as libc::c_int,
            Err(_) if signals::stop_requested() => return Ok(Fault::None),
            Err(err) => bail!("unable to communicate with fork server (OOM?): {err}"),
        };
        if !libc::WIFSTOPPED(status) {
            signals::set_child_pid(0);
        }
        signals::disarm_timer();

        // The child is gone; from here the maps are plain memory again.
        fence(SeqCst);

        let first_word = shm.first_word();
        classify_counts(shm.cov_mut());

        self.prev_timed_out = signals::child_timed_out();

        if libc::WIFSIGNALED(status) && !signals::stop_requested() {
            self.kill_signal = libc::WTERMSIG(status);
            if signals::child_timed_out() && self.kill_signal == libc::SIGKILL {
                return Ok(Fault::Timeout);
            }
            return Ok(Fault::Crash);
        }

        if self.uses_asan && libc::WEXITSTATUS(status) == MSAN_ERROR {
            self.kill_signal = 0;
            return Ok(Fault::Crash);
        }

        if first_word == EXEC_FAIL_SIG {
            return Ok(Fault::ExecFail);
        }

        Ok(Fault::None)
    }

    /// Signal that terminated the last crashing child, 0 for MSAN exits.
    pub fn last_kill_signal(&self) -> i32 {
        self.kill_signal
    }
}

impl Drop for ForkServer {
    fn drop(&mut self) {
        signals::set_forkserver_pid(0);
        signals::set_child_pid(0);
        // SAFETY: pid is our child; reap it so no zombie outlives us.
        unsafe {
            libc::kill(self.pid, libc::SIGKILL);
            let mut status: libc::c_int = 0;
            libc::waitpid(self.pid, &mut status, 0);
            libc::close(self.ctl_fd);
            libc::close(self.st_fd);
        }
    }
}

// ─── Child-side setup ────────────────────────────────────────────────────────

struct ChildSetup<'a> {
    ctl_read: RawFd,
    ctl_write: RawFd,
    st_read: RawFd,
    st_write: RawFd,
    dev_null: RawFd,
    stdin_fd: Option<RawFd>,
    mem_limit_mb: Option<u64>,
    shm_base: *mut u8,
    exec_path: *const libc::c_char,
    argv: *const *const libc::c_char,
    envp: *const *const libc::c_char,
    close_fds: &'a [RawFd],
}

impl ChildSetup<'_> {
    /// Runs in the forked child. Only raw syscalls on pre-built data; the
    /// one observable failure mode is the signature write before `_exit`.
    unsafe fn exec_or_die(&self) -> ! {
        let mut r: libc::rlimit = std::mem::zeroed();

        // Make sure the well-known descriptor numbers are usable.
        if libc::getrlimit(libc::RLIMIT_NOFILE, &mut r) == 0
            && r.rlim_cur < (FORKSRV_FD + 2) as libc::rlim_t
        {
            r.rlim_cur = (FORKSRV_FD + 2) as libc::rlim_t;
            libc::setrlimit(libc::RLIMIT_NOFILE, &r);
        }

        if let Some(mb) = self.mem_limit_mb {
            r.rlim_cur = (mb as libc::rlim_t) << 20;
            r.rlim_max = r.rlim_cur;
            libc::setrlimit(libc::RLIMIT_AS, &r);
        }

        // Core dumps are slow, and a SIGKILL landing mid-dump causes
        // anomalies the parent would misread.
        r.rlim_cur = 0;
        r.rlim_max = 0;
        libc::setrlimit(libc::RLIMIT_CORE, &r);

        libc::setsid();

        libc::dup2(self.dev_null, 1);
        libc::dup2(self.dev_null, 2);
        match self.stdin_fd {
            Some(fd) => {
                libc::dup2(fd, 0);
                libc::close(fd);
            }
            None => {
                libc::dup2(self.dev_null, 0);
            }
        }

        if libc::dup2(self.ctl_read, FORKSRV_FD) < 0
            || libc::dup2(self.st_write, FORKSRV_FD + 1) < 0
        {
            libc::_exit(1);
        }

        libc::close(self.ctl_read);
        libc::close(self.ctl_write);
        libc::close(self.st_read);
        libc::close(self.st_write);
        libc::close(self.dev_null);
        for &fd in self.close_fds {
            libc::close(fd);
        }

        libc::execve(self.exec_path, self.argv, self.envp);

        // Exec fell through: plant the signature for the parent.
        (self.shm_base as *mut u32).write_volatile(EXEC_FAIL_SIG);
        libc::_exit(0);
    }
}

/// Snapshot of the parent environment plus the knobs the child needs:
/// eager linker binding and sane sanitizer defaults (only when the user has
/// not provided their own).
fn build_envp() -> Vec<CString> {
    let mut have_asan = false;
    let mut have_msan = false;
    let mut have_lazy = false;

    let mut envp: Vec<CString> = std::env::vars_os()
        .filter_map(|(k, v)| {
            match k.as_bytes() {
                b"ASAN_OPTIONS" => have_asan = true,
                b"MSAN_OPTIONS" => have_msan = true,
                b"LD_BIND_LAZY" => have_lazy = true,
                _ => {}
            }
            let mut kv = k.as_bytes().to_vec();
            kv.push(b'=');
            kv.extend_from_slice(v.as_bytes());
            CString::new(kv).ok()
        })
        .collect();

    if !have_lazy {
        envp.push(CString::new("LD_BIND_NOW=1").unwrap());
    }
    if !have_asan {
        envp.push(
            CString::new(
                "ASAN_OPTIONS=abort_on_error=1:\
                 detect_leaks=0:\
                 symbolize=0:\
                 allocator_may_return_null=1",
            )
            .unwrap(),
        );
    }
    if !have_msan {
        envp.push(
            CString::new(format!(
                "MSAN_OPTIONS=exit_code={MSAN_ERROR}:\
                 symbolize=0:\
                 abort_on_error=1:\
                 allocator_may_return_null=1:\
                 msan_track_origins=0"
            ))
            .unwrap(),
        );
    }

    envp
}

// ─── Pipe helpers ────────────────────────────────────────────────────────────

fn write_u32(fd: RawFd, val: u32) -> io::Result<()> {
    let buf = val.to_ne_bytes();
    loop {
        // SAFETY: buf is 4 valid bytes.
        let n = unsafe { libc::write(fd, buf.as_ptr() as *const libc::c_void, 4) };
        if n == 4 {
            return Ok(());
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Err(io::Error::new(
            io::ErrorKind::WriteZero,
            format!("short write ({n} of 4 bytes)"),
        ));
    }
}

fn read_u32(fd: RawFd) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    loop {
        // SAFETY: buf is 4 valid bytes.
        let n = unsafe { libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, 4) };
        if n == 4 {
            return Ok(u32::from_ne_bytes(buf));
        }
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            format!("short read ({n} of 4 bytes)"),
        ));
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipe_helpers_round_trip() {
        let mut fds = [0 as RawFd; 2];
        assert_eq!(unsafe { libc::pipe(fds.as_mut_ptr()) }, 0);
        write_u32(fds[1], 0xdead_beef).unwrap();
        assert_eq!(read_u32(fds[0]).unwrap(), 0xdead_beef);
        unsafe {
            libc::close(fds[1]);
        }
        // Writer closed: the reader sees EOF, reported as a short read.
        assert!(read_u32(fds[0]).is_err());
        unsafe {
            libc::close(fds[0]);
        }
    }

    #[test]
    fn test_envp_defaults_present() {
        let envp = build_envp();
        let has = |prefix: &str| {
            envp.iter()
                .any(|e| e.to_bytes().starts_with(prefix.as_bytes()))
        };
        assert!(has("ASAN_OPTIONS=") || std::env::var_os("ASAN_OPTIONS").is_some());
        assert!(has("MSAN_OPTIONS=") || std::env::var_os("MSAN_OPTIONS").is_some());
    }
}

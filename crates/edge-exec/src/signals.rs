//! Signal and timer plumbing.
//!
//! Everything a signal handler may touch lives here as a process-wide atomic.
//! The timeout scheme is the classic one: a single-shot `ITIMER_REAL` is
//! armed around each blocking status-pipe read, and the SIGALRM handler kills
//! the current child, which makes the forkserver report termination through
//! the pipe — the read itself is never interrupted (`SA_RESTART`).

use anyhow::{bail, Result};
use std::io;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering::SeqCst};

static STOP_SOON: AtomicBool = AtomicBool::new(false);
static CHILD_TIMED_OUT: AtomicBool = AtomicBool::new(false);
static SKIP_REQUESTED: AtomicBool = AtomicBool::new(false);

/// PID of the fuzzed child. -1 means "handshake phase": a timeout then goes
/// to the forkserver itself. 0 means no live child.
static CHILD_PID: AtomicI32 = AtomicI32::new(-1);
static FORKSRV_PID: AtomicI32 = AtomicI32::new(0);

extern "C" fn handle_stop(_: libc::c_int) {
    STOP_SOON.store(true, SeqCst);

    let child = CHILD_PID.load(SeqCst);
    if child > 0 {
        unsafe { libc::kill(child, libc::SIGKILL) };
    }
    let fsrv = FORKSRV_PID.load(SeqCst);
    if fsrv > 0 {
        unsafe { libc::kill(fsrv, libc::SIGKILL) };
    }
}

extern "C" fn handle_timeout(_: libc::c_int) {
    let child = CHILD_PID.load(SeqCst);
    if child > 0 {
        CHILD_TIMED_OUT.store(true, SeqCst);
        unsafe { libc::kill(child, libc::SIGKILL) };
    } else if child == -1 {
        let fsrv = FORKSRV_PID.load(SeqCst);
        if fsrv > 0 {
            CHILD_TIMED_OUT.store(true, SeqCst);
            unsafe { libc::kill(fsrv, libc::SIGKILL) };
        }
    }
}

extern "C" fn handle_skip(_: libc::c_int) {
    SKIP_REQUESTED.store(true, SeqCst);
}

/// Install every handler the run loop depends on. Call once at startup,
/// before the forkserver exists.
pub fn install() -> Result<()> {
    unsafe {
        // Various ways of saying "stop". No SA_RESTART here: a blocked
        // accept() or socket read must come back with EINTR so the main loop
        // can see the flag and exit.
        set_handler(
            &[libc::SIGHUP, libc::SIGINT, libc::SIGTERM],
            handle_stop as *const () as libc::sighandler_t,
            0,
        )?;

        // Exec timeout notifications. SA_RESTART is required: the status
        // read must not be interrupted, the killed child's exit arrives
        // through the pipe.
        set_handler(
            &[libc::SIGALRM],
            handle_timeout as *const () as libc::sighandler_t,
            libc::SA_RESTART,
        )?;

        // SIGUSR1: abandon the current input.
        set_handler(
            &[libc::SIGUSR1],
            handle_skip as *const () as libc::sighandler_t,
            libc::SA_RESTART,
        )?;

        // Things we don't care about. SIGPIPE matters: a peer that vanishes
        // mid-reply must surface as a write error, not kill the process.
        set_handler(
            &[libc::SIGTSTP, libc::SIGPIPE, libc::SIGWINCH],
            libc::SIG_IGN,
            0,
        )?;
    }
    Ok(())
}

unsafe fn set_handler(
    sigs: &[libc::c_int],
    handler: libc::sighandler_t,
    flags: libc::c_int,
) -> Result<()> {
    let mut sa: libc::sigaction = std::mem::zeroed();
    sa.sa_sigaction = handler;
    sa.sa_flags = flags;
    libc::sigemptyset(&mut sa.sa_mask);

    for &sig in sigs {
        if libc::sigaction(sig, &sa, std::ptr::null_mut()) != 0 {
            bail!("sigaction({}) failed: {}", sig, io::Error::last_os_error());
        }
    }
    Ok(())
}

// ─── Flag accessors ──────────────────────────────────────────────────────────

pub fn stop_requested() -> bool {
    STOP_SOON.load(SeqCst)
}

pub fn child_timed_out() -> bool {
    CHILD_TIMED_OUT.load(SeqCst)
}

pub fn clear_child_timed_out() {
    CHILD_TIMED_OUT.store(false, SeqCst);
}

/// Consume a pending SIGUSR1 skip request.
pub fn take_skip_request() -> bool {
    SKIP_REQUESTED.swap(false, SeqCst)
}

pub fn set_child_pid(pid: libc::pid_t) {
    CHILD_PID.store(pid, SeqCst);
}

pub fn set_forkserver_pid(pid: libc::pid_t) {
    FORKSRV_PID.store(pid, SeqCst);
}

// ─── Interval timer ──────────────────────────────────────────────────────────

/// Arm the single-shot real-time timer. Only one user at a time; the
/// forkserver arms it around the handshake and around each status read.
pub fn arm_timer(ms: u32) {
    set_itimer(ms);
}

pub fn disarm_timer() {
    set_itimer(0);
}

fn set_itimer(ms: u32) {
    let it = libc::itimerval {
        it_interval: libc::timeval { tv_sec: 0, tv_usec: 0 },
        it_value: libc::timeval {
            tv_sec: (ms / 1000) as libc::time_t,
            tv_usec: ((ms % 1000) * 1000) as libc::suseconds_t,
        },
    };
    // SAFETY: writes only the process interval timer.
    unsafe { libc::setitimer(libc::ITIMER_REAL, &it, std::ptr::null_mut()) };
}

//! Shared telemetry region.
//!
//! One SysV shared-memory segment holds both maps the target writes: the
//! coverage bitmap (`MAP_SIZE` bytes) followed by the performance counters
//! (`PERF_SIZE` × u32). The parent creates and attaches the segment before
//! the forkserver is spawned and publishes its id through [`SHM_ENV_VAR`] so
//! the target's instrumentation can re-attach the same region.
//!
//! Access is sequential by protocol — the child writes only while it is
//! alive, the parent reads only after the status pipe reports termination —
//! so the views below carry no locking.

use anyhow::{bail, Result};
use std::ptr;

use crate::{MAP_SIZE, PERF_SIZE, SHM_ENV_VAR};

const REGION_LEN: usize = MAP_SIZE + PERF_SIZE * std::mem::size_of::<u32>();

pub struct SharedTelemetry {
    id: libc::c_int,
    base: *mut u8,
}

impl SharedTelemetry {
    /// Allocate and attach the segment. The id is not yet exported; call
    /// [`SharedTelemetry::export_env`] once before launching the forkserver.
    pub fn new() -> Result<Self> {
        // SAFETY: plain SysV calls; the mapping is page-aligned and lives
        // until shmctl(IPC_RMID) in Drop plus detach at process exit.
        unsafe {
            let id = libc::shmget(
                libc::IPC_PRIVATE,
                REGION_LEN,
                libc::IPC_CREAT | libc::IPC_EXCL | 0o600,
            );
            if id < 0 {
                bail!("shmget() failed: {}", std::io::Error::last_os_error());
            }

            let base = libc::shmat(id, ptr::null(), 0);
            if base as isize == -1 {
                let err = std::io::Error::last_os_error();
                libc::shmctl(id, libc::IPC_RMID, ptr::null_mut());
                bail!("shmat() failed: {}", err);
            }

            Ok(Self { id, base: base as *mut u8 })
        }
    }

    /// Publish the segment id for the target's instrumentation.
    pub fn export_env(&self) {
        std::env::set_var(SHM_ENV_VAR, self.id.to_string());
    }

    /// Coverage bitmap, one byte per edge.
    pub fn cov(&self) -> &[u8] {
        // SAFETY: base points at REGION_LEN valid bytes for self's lifetime.
        unsafe { std::slice::from_raw_parts(self.base, MAP_SIZE) }
    }

    pub fn cov_mut(&mut self) -> &mut [u8] {
        // SAFETY: base points at REGION_LEN valid bytes for self's lifetime;
        // &mut self guarantees the view is exclusive.
        unsafe { std::slice::from_raw_parts_mut(self.base, MAP_SIZE) }
    }

    /// Performance counters. Slot 0 is the aggregate cost.
    pub fn perf(&self) -> &[u32] {
        // SAFETY: the perf map starts MAP_SIZE bytes in; shmat returns a
        // page-aligned base and MAP_SIZE is a multiple of four, so the u32
        // view is aligned.
        unsafe { std::slice::from_raw_parts(self.base.add(MAP_SIZE) as *const u32, PERF_SIZE) }
    }

    /// Zero both maps. Runs before every execution; the target zeroes them
    /// too, this is the parent-side guarantee.
    pub fn reset(&mut self) {
        // SAFETY: in-bounds write of the whole region.
        unsafe { ptr::write_bytes(self.base, 0, REGION_LEN) }
    }

    /// First 32-bit word of the coverage map, read volatile. Carries the
    /// exec-failure signature when the child's `execve` fell through.
    pub fn first_word(&self) -> u32 {
        unsafe { (self.base as *const u32).read_volatile() }
    }

    /// Raw base pointer, for the forked child's exec-fallthrough marker.
    pub fn base_ptr(&self) -> *mut u8 {
        self.base
    }
}

impl Drop for SharedTelemetry {
    fn drop(&mut self) {
        // SAFETY: id refers to the segment created in new(). Marking it for
        // removal here means no stale segment survives the process.
        unsafe {
            libc::shmctl(self.id, libc::IPC_RMID, ptr::null_mut());
            libc::shmdt(self.base as *const libc::c_void);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_views_share_one_region() {
        let mut shm = SharedTelemetry::new().expect("shmget");
        shm.reset();
        assert!(shm.cov().iter().all(|&b| b == 0));
        assert!(shm.perf().iter().all(|&v| v == 0));

        shm.cov_mut()[0] = 0xad;
        shm.cov_mut()[1] = 0xde;
        shm.cov_mut()[2] = 0xe1;
        shm.cov_mut()[3] = 0xfe;
        assert_eq!(shm.first_word(), u32::from_le_bytes([0xad, 0xde, 0xe1, 0xfe]));

        shm.reset();
        assert_eq!(shm.first_word(), 0);
    }

    #[test]
    fn test_export_env_round_trips() {
        let shm = SharedTelemetry::new().expect("shmget");
        shm.export_env();
        let id: i32 = std::env::var(SHM_ENV_VAR).unwrap().parse().unwrap();
        assert_eq!(id, shm.id);
    }
}

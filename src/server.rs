//! TCP agent server.
//!
//! One connection at a time, one fuzzing session per connection, one
//! execution per message. The agent sends a fixed 20-byte header followed by
//! the raw input; the reply is the same bytes with the four feedback fields
//! overwritten. The agent guarantees one complete frame per `read()`.

use anyhow::{bail, Context, Result};
use socket2::{Domain, Protocol, Socket, Type};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::time::Instant;
use tracing::{info, warn};

use edge_exec::feedback::{hotspot, summed_cost, total_cost};
use edge_exec::{
    signals, Fault, FeedbackEngine, ForkServer, NewCoverage, SharedTelemetry, TestcaseIo, MAP_SIZE,
};

use crate::outdir::OutputDir;
use crate::stats::{render_input, SessionCsv, Stats, TextLog};

// ─── Frame layout ────────────────────────────────────────────────────────────
//
// Little-endian, packed; the input tail runs to the end of the frame.
//
//   offset  0  u32 exec_cost
//   offset  4  u8  has_new_max        (3 bytes padding follow)
//   offset  8  u32 hotspot
//   offset 12  u32 has_new_bits
//   offset 16  [u8; 4] run_type       "nml\0" or "wup\0"
//   offset 20  input…

pub const FRAME_HDR: usize = 20;
const OFF_EXEC_COST: usize = 0;
const OFF_HAS_NEW_MAX: usize = 4;
const OFF_HOTSPOT: usize = 8;
const OFF_HAS_NEW_BITS: usize = 12;
const OFF_RUN_TYPE: usize = 16;

const WARMUP_TAG: [u8; 4] = *b"wup\0";

/// One read per frame; the agent's inputs are small, this leaves headroom.
const READ_BUF_LEN: usize = 64 * 1024;

/// Re-executions allowed to resolve a consistency mismatch before giving up.
const CONSISTENCY_RETRIES: u32 = 10;

/// Consecutive timeouts before a warning that the input stream looks wedged.
const TMOUT_SKIP_LIMIT: u32 = 250;

/// Inputs beyond this draw a one-time advisory; huge inputs mostly measure
/// parser throughput, not path cost.
const INPUT_WARN_LEN: usize = 1 << 20;

/// A single run slower than this draws a one-time advisory.
const SLOW_RUN_WARN_MS: u128 = 2_000;

fn run_type(frame: &[u8]) -> [u8; 4] {
    frame[OFF_RUN_TYPE..OFF_RUN_TYPE + 4].try_into().unwrap()
}

fn is_warmup(frame: &[u8]) -> bool {
    run_type(frame) == WARMUP_TAG
}

fn input_of(frame: &[u8]) -> &[u8] {
    &frame[FRAME_HDR..]
}

/// Overwrite the feedback fields in place; everything else echoes back.
fn patch_feedback(frame: &mut [u8], cost: u32, new_max: bool, hs: u32, new_bits: NewCoverage) {
    frame[OFF_EXEC_COST..OFF_EXEC_COST + 4].copy_from_slice(&cost.to_le_bytes());
    frame[OFF_HAS_NEW_MAX] = new_max as u8;
    frame[OFF_HOTSPOT..OFF_HOTSPOT + 4].copy_from_slice(&hs.to_le_bytes());
    frame[OFF_HAS_NEW_BITS..OFF_HAS_NEW_BITS + 4]
        .copy_from_slice(&(new_bits as u32).to_le_bytes());
}

// ─── Server ──────────────────────────────────────────────────────────────────

/// Everything one fuzzing instance owns, threaded explicitly — no globals
/// beyond the signal flags.
pub struct Harness {
    // Declaration order is drop order: the forkserver must be killed and
    // reaped before the shared segment it is attached to goes away.
    pub forkserver: ForkServer,
    pub shm: SharedTelemetry,
    pub engine: FeedbackEngine,
    pub testcase: TestcaseIo,
    pub outdir: OutputDir,
    pub stats: Stats,
    pub rl_log: TextLog,
    pub debug_log: TextLog,
    /// Per-run timeout (pinned to 10 s in agent mode).
    pub exec_tmout: u32,
    /// Timeout for consistency-retry re-executions (AFL_HANG_TMOUT).
    pub retry_tmout: u32,
    pub flush_interval_secs: u64,
}

impl Harness {
    /// Accept connections until a stop is requested. Fatal conditions (a
    /// forkserver protocol breakdown, an unresolvable consistency mismatch)
    /// propagate out; everything else is per-connection.
    pub fn serve(&mut self, bind: &str, port: u16) -> Result<()> {
        let listener = build_listener(bind, port)?;
        info!("server listening on port {}", port);
        info!("target execution timeout: {} ms", self.exec_tmout);
        self.rl_log.line("-- Ready for connection!");

        loop {
            if signals::stop_requested() {
                break;
            }
            let (stream, peer) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("accept() failed: {}", e);
                    continue;
                }
            };

            info!("accepted connection from {}", peer);
            self.stats.connections += 1;
            self.handle_connection(stream)?;

            let cvg = self.bitmap_cvg_pct();
            self.outdir.write_bitmap(self.engine.virgin())?;
            self.stats.write_fuzzer_stats(&self.outdir, cvg)?;
            self.stats.append_plot(&self.outdir, cvg)?;
            info!("connection closed; ready for another experiment");
        }

        Ok(())
    }

    /// One session: fresh reference state, then read → execute → reply until
    /// the peer hangs up.
    fn handle_connection(&mut self, mut stream: TcpStream) -> Result<()> {
        self.engine.reset_session();
        let mut session_csv = SessionCsv::create(&self.outdir)?;

        let mut buf = vec![0u8; READ_BUF_LEN];
        let mut messages: u64 = 0;
        let mut max_cost_observed: u32 = 0;
        let mut max_hotspot: u32 = 0;
        let mut subseq_tmouts: u32 = 0;
        let mut warned_large_input = false;
        let mut warned_slow_target = false;
        let mut last_flush = Instant::now();

        loop {
            if signals::stop_requested() {
                break;
            }

            let nread = match stream.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => n,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    warn!("socket read failed: {}", e);
                    break;
                }
            };

            messages += 1;
            self.rl_log.line(&format!(
                "\n========================= Message {} =============================",
                messages
            ));
            self.rl_log.line(&format!("-- Received new {} bytes", nread));

            // A read that fills the buffer means the frame may continue past
            // it; reject loudly rather than process a silent truncation.
            if nread == buf.len() {
                warn!(
                    "frame of {} bytes or more exceeds the {} byte read buffer, dropped",
                    nread,
                    buf.len()
                );
                self.rl_log.line(&format!(
                    "-- Oversized frame (>= {} bytes), dropped",
                    buf.len()
                ));
                continue;
            }

            if nread < FRAME_HDR {
                warn!("runt frame ({} bytes), no reply possible", nread);
                self.rl_log
                    .line(&format!("-- Runt frame ({} bytes), dropped", nread));
                continue;
            }

            let frame = &mut buf[..nread];
            let input = input_of(frame).to_vec();
            let warmup = is_warmup(frame);
            self.rl_log.line(&format!(
                "-- Package contents: input={}, run-type={:?}, len={}",
                render_input(&input),
                String::from_utf8_lossy(&run_type(frame)),
                input.len(),
            ));

            if input.len() > INPUT_WARN_LEN && !warned_large_input {
                warn!("input of {} bytes; large inputs slow every run down", input.len());
                warned_large_input = true;
            }

            // Execute once; faults are logged, replied to, and survived.
            self.testcase.write(&input)?;
            let run_started = Instant::now();
            let fault = self.forkserver.run(&mut self.shm, self.exec_tmout)?;
            self.stats.execs += 1;
            if signals::stop_requested() {
                break;
            }
            if run_started.elapsed().as_millis() > SLOW_RUN_WARN_MS
                && fault != Fault::Timeout
                && !warned_slow_target
            {
                warn!(
                    "target is slow ({} ms per run); expect low throughput",
                    run_started.elapsed().as_millis()
                );
                warned_slow_target = true;
            }
            self.log_fault(fault, &input);

            if fault == Fault::Timeout {
                subseq_tmouts += 1;
                if subseq_tmouts > TMOUT_SKIP_LIMIT {
                    warn!("too many subsequent timeouts, input stream looks wedged");
                    self.rl_log.line(&format!(
                        "Too many subsequent timeouts. Input: {} [len: {}]",
                        render_input(&input),
                        input.len()
                    ));
                }
            } else {
                subseq_tmouts = 0;
            }

            if signals::take_skip_request() {
                self.rl_log
                    .line("-- Input abandoned on request (SIGUSR1)");
            }

            // The aggregate in slot 0 must equal the per-edge sum; re-run a
            // bounded number of times before declaring the target broken.
            let cost = match self.enforce_consistency(&input)? {
                Some(cost) => cost,
                None => break, // stop requested mid-retry
            };

            // Warmup runs must leave the reference state untouched.
            let (new_bits, new_max, hs) = if warmup {
                (NewCoverage::None, false, 0)
            } else {
                let mut updates: u32 = 0;
                let mut increase: u64 = 0;
                let debug_log = &mut self.debug_log;
                let new_max = self
                    .engine
                    .has_new_max(self.shm.perf(), |i, old, new| {
                        debug_log.line(&format!(
                            "New max(0x{:04x}) = {} (earlier was: {})",
                            i, new, old
                        ));
                        updates += 1;
                        increase += (new - old) as u64;
                    });
                let hs = hotspot(self.shm.perf());
                let new_bits = self.engine.has_new_bits(self.shm.cov());
                if new_max {
                    session_csv.row(updates, messages, &input, cost, increase);
                }
                (new_bits, new_max, hs)
            };

            patch_feedback(frame, cost, new_max, hs, new_bits);
            self.rl_log.line(&format!(
                "-- Sending response back: exec_cost={}, hnb={}, hnm={}, hs={}",
                cost, new_bits as u32, new_max, hs
            ));

            if let Err(e) = stream.write_all(frame) {
                warn!("reply write failed: {}", e);
                break;
            }

            max_cost_observed = max_cost_observed.max(cost);
            max_hotspot = max_hotspot.max(hs);
            self.stats.messages += 1;
            self.stats.max_cost = self.stats.max_cost.max(cost);
            self.stats.max_hotspot = self.stats.max_hotspot.max(hs);

            print!(
                "\rProcessed {} messages!, max-cost-observed={}, max-hotspot={}, last seen cost={}",
                messages, max_cost_observed, max_hotspot, cost
            );
            std::io::stdout().flush().ok();

            if last_flush.elapsed().as_secs() >= self.flush_interval_secs {
                let cvg = self.bitmap_cvg_pct();
                self.stats.write_fuzzer_stats(&self.outdir, cvg)?;
                self.stats.append_plot(&self.outdir, cvg)?;
                last_flush = Instant::now();
            }
        }

        if messages > 0 {
            println!();
        }
        Ok(())
    }

    /// Verify slot 0 equals the per-edge sum, re-running (testcase rewritten
    /// first, so stdin-fed targets see their input again) until it holds or
    /// the retries run out. Returns the settled cost, or `None` on a stop
    /// request.
    fn enforce_consistency(&mut self, input: &[u8]) -> Result<Option<u32>> {
        let (mut cost, mut sum) = {
            let perf = self.shm.perf();
            (total_cost(perf), summed_cost(perf))
        };

        let mut attempts = 0;
        while sum != cost {
            if attempts == CONSISTENCY_RETRIES {
                self.rl_log.line(&format!(
                    "-- FATAL: perf map inconsistent after {} attempts, input={}",
                    attempts,
                    render_input(input)
                ));
                bail!(
                    "perf map inconsistent: slot 0 is {} but the edge sum is {} \
                     after {} attempts; offending input: {}",
                    cost,
                    sum,
                    attempts,
                    render_input(input)
                );
            }
            attempts += 1;
            warn!(
                "perf map mismatch: slot 0 is {} but the edge sum is {}; re-running (attempt #{})",
                cost, sum, attempts
            );

            self.testcase.write(input)?;
            let _ = self.forkserver.run(&mut self.shm, self.retry_tmout)?;
            self.stats.execs += 1;
            if signals::stop_requested() {
                return Ok(None);
            }

            let perf = self.shm.perf();
            cost = total_cost(perf);
            sum = summed_cost(perf);
        }

        Ok(Some(cost))
    }

    fn log_fault(&mut self, fault: Fault, input: &[u8]) {
        match fault {
            Fault::None => {}
            Fault::Timeout => {
                warn!("run timed out (len {})", input.len());
                self.rl_log.line(&format!(
                    "-- FAULT_TMOUT: Len={}, Input={}",
                    input.len(),
                    render_input(input)
                ));
            }
            Fault::Crash => {
                warn!(
                    "target crashed with signal {} (len {})",
                    self.forkserver.last_kill_signal(),
                    input.len()
                );
                self.rl_log.line(&format!(
                    "-- FAULT_CRASH: Len={}, Input={}",
                    input.len(),
                    render_input(input)
                ));
            }
            Fault::ExecFail => {
                warn!("unable to execute target (len {})", input.len());
                self.rl_log.line(&format!(
                    "-- FAULT_ERROR: Len={}, Input={}",
                    input.len(),
                    render_input(input)
                ));
            }
        }
    }

    pub fn bitmap_cvg_pct(&self) -> f64 {
        self.engine.covered_bytes() as f64 / MAP_SIZE as f64 * 100.0
    }
}

fn build_listener(bind: &str, port: u16) -> Result<TcpListener> {
    let addr: SocketAddr = format!("{bind}:{port}")
        .parse()
        .with_context(|| format!("bad bind address '{bind}:{port}'"))?;

    let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP))
        .context("socket creation failed")?;
    socket
        .set_reuse_address(true)
        .context("SO_REUSEADDR failed")?;
    socket
        .bind(&addr.into())
        .with_context(|| format!("bind to {addr} failed"))?;
    socket.listen(3).context("listen failed")?;
    Ok(socket.into())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(run_type: &[u8; 4], input: &[u8]) -> Vec<u8> {
        let mut f = vec![0u8; FRAME_HDR];
        f[OFF_RUN_TYPE..OFF_RUN_TYPE + 4].copy_from_slice(run_type);
        f.extend_from_slice(input);
        f
    }

    #[test]
    fn test_frame_accessors() {
        let f = frame(b"nml\0", b"hello");
        assert!(!is_warmup(&f));
        assert_eq!(input_of(&f), b"hello");

        let w = frame(b"wup\0", b"");
        assert!(is_warmup(&w));
        assert!(input_of(&w).is_empty());
    }

    #[test]
    fn test_patch_feedback_layout() {
        let mut f = frame(b"nml\0", b"xyz");
        patch_feedback(&mut f, 0x0102_0304, true, 0x0a0b_0c0d, NewCoverage::NewEdge);

        assert_eq!(&f[0..4], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(f[4], 1);
        assert_eq!(&f[8..12], &[0x0d, 0x0c, 0x0b, 0x0a]);
        assert_eq!(&f[12..16], &[2, 0, 0, 0]);
        // run_type and input echo back untouched.
        assert_eq!(&f[16..20], b"nml\0");
        assert_eq!(&f[20..], b"xyz");
    }

    #[test]
    fn test_patch_feedback_preserves_length() {
        let mut f = frame(b"wup\0", &vec![0xa5; 1000]);
        let before = f.len();
        patch_feedback(&mut f, 1, false, 2, NewCoverage::None);
        assert_eq!(f.len(), before);
        assert_eq!(f[4], 0);
    }
}

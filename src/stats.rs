//! Session statistics and diagnostic logs.
//!
//! Four sinks, all under the output directory:
//! - `fuzzer_stats`: rewritten "key : value" snapshot.
//! - `plot_data`: append-only CSV of timeline metrics.
//! - `rl_interactions.log`: per-message transcript of the agent dialogue.
//! - `max-ct-fuzzing.log`: per-index new-maximum debug lines.
//! A per-connection `max-count-diff.csv` summarizes the runs that raised
//! some counter's maximum.

use anyhow::{Context, Result};
use chrono::Utc;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::os::unix::io::{AsRawFd, RawFd};
use std::path::PathBuf;
use std::time::Instant;

use crate::outdir::OutputDir;

// ─── Counters ────────────────────────────────────────────────────────────────

pub struct Stats {
    start_unix: i64,
    started: Instant,
    pub connections: u64,
    pub messages: u64,
    pub execs: u64,
    pub max_cost: u32,
    pub max_hotspot: u32,
    exec_tmout: u32,
    cmdline: String,
}

impl Stats {
    pub fn new(exec_tmout: u32, cmdline: String) -> Self {
        Self {
            start_unix: Utc::now().timestamp(),
            started: Instant::now(),
            connections: 0,
            messages: 0,
            execs: 0,
            max_cost: 0,
            max_hotspot: 0,
            exec_tmout,
            cmdline,
        }
    }

    /// Rewrite `fuzzer_stats` with the current counters.
    pub fn write_fuzzer_stats(&self, out: &OutputDir, bitmap_cvg_pct: f64) -> Result<()> {
        let elapsed = self.started.elapsed().as_secs_f64().max(0.001);
        let path = out.file("fuzzer_stats");
        let body = format!(
            "start_time        : {}\n\
             last_update       : {}\n\
             fuzzer_pid        : {}\n\
             connections_done  : {}\n\
             messages_done     : {}\n\
             execs_done        : {}\n\
             execs_per_sec     : {:.2}\n\
             bitmap_cvg        : {:.2}%\n\
             max_cost          : {}\n\
             max_hotspot       : {}\n\
             exec_timeout      : {}\n\
             command_line      : {}\n",
            self.start_unix,
            Utc::now().timestamp(),
            std::process::id(),
            self.connections,
            self.messages,
            self.execs,
            self.execs as f64 / elapsed,
            bitmap_cvg_pct,
            self.max_cost,
            self.max_hotspot,
            self.exec_tmout,
            self.cmdline,
        );
        std::fs::write(&path, body)
            .with_context(|| format!("unable to write '{}'", path.display()))
    }

    /// Append one timeline row to `plot_data`, creating it with a header on
    /// first use.
    pub fn append_plot(&self, out: &OutputDir, bitmap_cvg_pct: f64) -> Result<()> {
        let path = out.file("plot_data");
        let fresh = !path.exists();
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("unable to open '{}'", path.display()))?;
        if fresh {
            writeln!(
                f,
                "# unix_time, connections, messages, execs, max_cost, max_hotspot, bitmap_cvg"
            )?;
        }
        writeln!(
            f,
            "{}, {}, {}, {}, {}, {}, {:.2}%",
            Utc::now().timestamp(),
            self.connections,
            self.messages,
            self.execs,
            self.max_cost,
            self.max_hotspot,
            bitmap_cvg_pct,
        )?;
        Ok(())
    }
}

// ─── Plain-text diagnostic logs ──────────────────────────────────────────────

/// Line-oriented log file, truncated at creation, flushed per line so the
/// transcript survives an abort.
pub struct TextLog {
    w: BufWriter<File>,
    path: PathBuf,
}

impl TextLog {
    pub fn create(path: PathBuf) -> Result<Self> {
        let f = File::create(&path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        Ok(Self {
            w: BufWriter::new(f),
            path,
        })
    }

    pub fn line(&mut self, msg: &str) {
        if writeln!(self.w, "{msg}").and_then(|_| self.w.flush()).is_err() {
            tracing::warn!("write to '{}' failed", self.path.display());
        }
    }

    /// Underlying descriptor — the forkserver child closes it.
    pub fn raw_fd(&self) -> RawFd {
        self.w.get_ref().as_raw_fd()
    }
}

/// Render untrusted input bytes as a JSON-escaped string so arbitrary binary
/// never corrupts the line-oriented logs.
pub fn render_input(input: &[u8]) -> String {
    serde_json::to_string(&String::from_utf8_lossy(input)).unwrap_or_else(|_| "\"?\"".into())
}

// ─── Per-connection summary ──────────────────────────────────────────────────

/// `max-count-diff.csv`: one row per run that raised a counter maximum.
pub struct SessionCsv {
    w: BufWriter<File>,
}

impl SessionCsv {
    pub fn create(out: &OutputDir) -> Result<Self> {
        let path = out.file("max-count-diff.csv");
        let f = File::create(&path)
            .with_context(|| format!("unable to create '{}'", path.display()))?;
        let mut w = BufWriter::new(f);
        writeln!(
            w,
            "max_counter,message_id,input,perf_bits_total,increase_from_max_count"
        )?;
        Ok(Self { w })
    }

    pub fn row(&mut self, updated: u32, message_id: u64, input: &[u8], cost: u32, increase: u64) {
        let _ = writeln!(
            self.w,
            "{},{},{},{},{}",
            updated,
            message_id,
            render_input(input),
            cost,
            increase
        );
        let _ = self.w.flush();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fuzzer_stats_format() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(&dir.path().join("out")).unwrap();
        let mut stats = Stats::new(10_000, "edgerunner -p".into());
        stats.execs = 42;
        stats.write_fuzzer_stats(&out, 1.5).unwrap();

        let body = std::fs::read_to_string(out.file("fuzzer_stats")).unwrap();
        assert!(body.contains("execs_done        : 42"));
        assert!(body.contains("bitmap_cvg        : 1.50%"));
        assert!(body.contains("exec_timeout      : 10000"));
    }

    #[test]
    fn test_plot_data_header_written_once() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(&dir.path().join("out")).unwrap();
        let stats = Stats::new(10_000, String::new());
        stats.append_plot(&out, 0.0).unwrap();
        stats.append_plot(&out, 0.0).unwrap();

        let body = std::fs::read_to_string(out.file("plot_data")).unwrap();
        assert_eq!(body.matches('#').count(), 1);
        assert_eq!(body.lines().count(), 3);
    }

    #[test]
    fn test_render_input_escapes() {
        assert_eq!(render_input(b"abc"), "\"abc\"");
        let rendered = render_input(b"a\nb\x00");
        assert!(rendered.starts_with('"') && rendered.ends_with('"'));
        assert!(!rendered.contains('\n'));
    }

    #[test]
    fn test_session_csv_rows() {
        let dir = tempfile::tempdir().unwrap();
        let out = OutputDir::create(&dir.path().join("out")).unwrap();
        let mut csv = SessionCsv::create(&out).unwrap();
        csv.row(3, 7, b"in", 120, 15);

        let body = std::fs::read_to_string(out.file("max-count-diff.csv")).unwrap();
        let mut lines = body.lines();
        assert!(lines.next().unwrap().starts_with("max_counter,"));
        assert_eq!(lines.next().unwrap(), "3,7,\"in\",120,15");
    }
}

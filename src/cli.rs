//! CLI definitions for edgerunner.

use clap::Parser;
use std::path::PathBuf;

#[derive(Parser)]
#[clap(
    name = "edgerunner",
    version,
    about = "Execution and feedback server for agent-driven, cost-guided fuzzing\n\nRuns an instrumented target under a forkserver and serves per-run cost and coverage feedback to a driving agent over TCP.",
    long_about = None
)]
pub struct Cli {
    /// Directory with seed test cases (the agent owns scheduling; only
    /// checked for existence)
    #[clap(short = 'i', long = "input")]
    pub input_dir: PathBuf,

    /// Output directory for session state and diagnostics
    #[clap(short = 'o', long = "output")]
    pub output_dir: PathBuf,

    /// Deliver test cases through this file instead of the target's stdin
    #[clap(short = 'f', long = "file")]
    pub testcase_file: Option<PathBuf>,

    /// Per-run timeout in ms (pinned to 10000 in agent mode)
    #[clap(short = 't', long = "timeout")]
    pub timeout_ms: Option<u32>,

    /// Child memory cap in MB, suffix k/M/G/T, or "none"
    #[clap(short = 'm', long = "mem-limit", default_value = "50", value_parser = parse_mem_limit)]
    pub mem_limit: MemLimit,

    /// Track the per-edge performance map (required in agent mode)
    #[clap(short = 'p', long = "perf-map")]
    pub perf_map: bool,

    /// Run without instrumentation (unsupported in agent mode)
    #[clap(short = 'n', long = "dumb")]
    pub dumb: bool,

    /// Run an uninstrumented binary under QEMU user-mode emulation
    #[clap(short = 'Q', long = "qemu")]
    pub qemu: bool,

    /// Dictionary file or directory (accepted for lineage compatibility,
    /// unused here — mutation belongs to the agent)
    #[clap(short = 'x', long = "extras")]
    pub extras: Option<PathBuf>,

    /// TCP port the agent connects to
    #[clap(short = 'N', long = "port")]
    pub port: Option<u16>,

    /// Optional TOML config file
    #[clap(short = 'c', long = "config")]
    pub config: Option<PathBuf>,

    /// Target command line; "@@" is replaced with the testcase path
    #[clap(last = true, required = true)]
    pub target: Vec<String>,
}

/// Child memory cap in MB. `None` means unlimited.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MemLimit(pub Option<u64>);

/// Parse `-m`: plain MB, a `k`/`M`/`G`/`T` suffix, or "none".
fn parse_mem_limit(s: &str) -> Result<MemLimit, String> {
    if s == "none" {
        return Ok(MemLimit(None));
    }

    let split = s
        .char_indices()
        .find(|(_, c)| !c.is_ascii_digit())
        .map(|(i, _)| i)
        .unwrap_or(s.len());
    let (num, suffix) = s.split_at(split);
    let base: u64 = num
        .parse()
        .map_err(|_| format!("bad memory limit '{s}'"))?;

    let mb = match suffix {
        "" | "M" => base,
        "T" => base * 1024 * 1024,
        "G" => base * 1024,
        "k" => base / 1024,
        other => return Err(format!("unsupported memory limit suffix '{other}'")),
    };

    if mb < 5 {
        return Err(format!("dangerously low memory limit: {mb} MB"));
    }
    if mb > 2_000_000 {
        return Err(format!("memory limit out of range: {mb} MB"));
    }
    Ok(MemLimit(Some(mb)))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mem_limit_plain_and_suffixed() {
        assert_eq!(parse_mem_limit("50"), Ok(MemLimit(Some(50))));
        assert_eq!(parse_mem_limit("100M"), Ok(MemLimit(Some(100))));
        assert_eq!(parse_mem_limit("2G"), Ok(MemLimit(Some(2048))));
        assert_eq!(parse_mem_limit("1T"), Ok(MemLimit(Some(1024 * 1024))));
        assert_eq!(parse_mem_limit("10240k"), Ok(MemLimit(Some(10))));
        assert_eq!(parse_mem_limit("none"), Ok(MemLimit(None)));
    }

    #[test]
    fn test_mem_limit_rejects_nonsense() {
        assert!(parse_mem_limit("").is_err());
        assert!(parse_mem_limit("x").is_err());
        assert!(parse_mem_limit("50Q").is_err());
        assert!(parse_mem_limit("1k").is_err(), "rounds down to 0 MB");
        assert!(parse_mem_limit("3").is_err(), "dangerously low");
        assert!(parse_mem_limit("3000000").is_err(), "out of range");
    }

    #[test]
    fn test_cli_parses_target_after_double_dash() {
        let cli = Cli::try_parse_from([
            "edgerunner",
            "-i", "seeds",
            "-o", "out",
            "-p",
            "--",
            "./target",
            "--flag",
            "@@",
        ])
        .unwrap();
        assert!(cli.perf_map);
        assert_eq!(cli.target, vec!["./target", "--flag", "@@"]);
        assert_eq!(cli.mem_limit, MemLimit(Some(50)));
        assert_eq!(cli.port, None);
    }
}

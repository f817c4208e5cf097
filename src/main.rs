//! edgerunner — execution and feedback server for agent-driven fuzzing.
//!
//! An external agent proposes inputs over TCP; each one is executed in an
//! instrumented target under a forkserver, and the derived cost/coverage
//! signals go back in the reply. Run `edgerunner --help` for usage.

use anyhow::{bail, Context, Result};
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use edge_exec::{signals, FeedbackEngine, ForkServer, SharedTelemetry, TargetSpec, TestcaseIo};

mod cli;
mod config;
mod outdir;
mod server;
mod stats;

use cli::Cli;
use config::HarnessConfig;
use outdir::OutputDir;
use server::Harness;
use stats::{Stats, TextLog};

/// Per-run timeout in agent mode. Expensive inputs are the whole point of
/// cost-guided search, so this is deliberately generous; the agent is told
/// about timeouts through the fault log rather than starved of replies.
const AGENT_EXEC_TMOUT_MS: u32 = 10_000;

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("info".parse()?))
        .init();

    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => HarnessConfig::load(path)?,
        None => HarnessConfig::default(),
    };

    // Agent mode is the only mode: the perf map is mandatory, dumb mode and
    // forkserver-less operation have no sensible meaning here.
    if !cli.perf_map {
        bail!("the agent protocol requires the performance map; pass -p");
    }
    if cli.dumb {
        bail!("dumb mode (-n) is unsupported in agent mode");
    }
    if std::env::var_os("AFL_NO_FORKSRV").is_some() {
        bail!("AFL_NO_FORKSRV is unsupported in agent mode");
    }

    if let Some(extras) = &cli.extras {
        warn!(
            "extras path '{}' is ignored: mutation belongs to the agent",
            extras.display()
        );
    }
    if std::env::var_os("AFL_FAST_CAL").is_some() {
        info!("AFL_FAST_CAL has no effect: calibration belongs to the agent");
    }
    if std::env::var_os("AFL_NO_AFFINITY").is_some() {
        info!("AFL_NO_AFFINITY has no effect: agent mode never binds cores");
    }
    if let Some(preload) = std::env::var_os("AFL_PRELOAD") {
        std::env::set_var("LD_PRELOAD", &preload);
        std::env::set_var("DYLD_INSERT_LIBRARIES", &preload);
    }

    if !cli.input_dir.is_dir() {
        bail!(
            "input directory '{}' does not exist",
            cli.input_dir.display()
        );
    }

    let exec_tmout = AGENT_EXEC_TMOUT_MS;
    if let Some(requested) = cli.timeout_ms {
        if requested != exec_tmout {
            warn!(
                "-t {} overridden to {} ms: agent mode pins the run timeout",
                requested, exec_tmout
            );
        }
    }
    let retry_tmout = match std::env::var("AFL_HANG_TMOUT") {
        Ok(v) => v
            .parse::<u32>()
            .ok()
            .filter(|&ms| ms > 0)
            .context("invalid value of AFL_HANG_TMOUT")?,
        Err(_) => exec_tmout,
    };

    check_cpu_governor();

    let outdir = OutputDir::create(&cli.output_dir)?;
    info!("output directory: {}", outdir.path().display());
    signals::install()?;

    let shm = SharedTelemetry::new()?;
    shm.export_env();

    // Testcase delivery: a file if the target names one (via -f or @@),
    // otherwise a rewound fd on its stdin.
    let mut target = TargetSpec::new(&cli.target[0], cli.target[1..].to_vec(), cli.qemu)?;
    let uses_file = cli.testcase_file.is_some() || target.args.iter().any(|a| a.contains("@@"));
    let testcase = if uses_file {
        let path = cli
            .testcase_file
            .clone()
            .unwrap_or_else(|| outdir.default_testcase_path());
        target.substitute_file_args(&path);
        TestcaseIo::file(path)
    } else {
        TestcaseIo::stdin(outdir.default_testcase_path())?
    };

    target.vet(std::env::var_os("AFL_SKIP_BIN_CHECK").is_some())?;

    let rl_log = TextLog::create(outdir.file("rl_interactions.log"))?;
    let debug_log = TextLog::create(outdir.file("max-ct-fuzzing.log"))?;

    let close_fds = [outdir.lock_fd(), rl_log.raw_fd(), debug_log.raw_fd()];
    let forkserver = ForkServer::start(
        &target,
        &shm,
        &testcase,
        cli.mem_limit.0,
        exec_tmout,
        &close_fds,
    )?;

    let cmdline: String = std::env::args().collect::<Vec<_>>().join(" ");
    let mut harness = Harness {
        shm,
        forkserver,
        engine: FeedbackEngine::new(),
        testcase,
        outdir,
        stats: Stats::new(exec_tmout, cmdline),
        rl_log,
        debug_log,
        exec_tmout,
        retry_tmout,
        flush_interval_secs: config.stats.flush_interval_secs,
    };

    let port = cli.port.unwrap_or(config.server.port);
    let served = harness.serve(&config.server.bind, port);

    // Final state, written even when serve() failed so the postmortem has
    // something to look at. The shm segment and forkserver go down with the
    // harness's Drop impls.
    let cvg = harness.bitmap_cvg_pct();
    harness.outdir.write_bitmap(harness.engine.virgin()).ok();
    harness.stats.write_fuzzer_stats(&harness.outdir, cvg).ok();
    harness.stats.append_plot(&harness.outdir, cvg).ok();

    served?;
    info!("testing stopped by user, clean shutdown");
    Ok(())
}

/// An on-demand scaling governor adds wakeup latency to every single exec.
/// Purely advisory; throughput suffers, correctness does not.
fn check_cpu_governor() {
    let Ok(governor) =
        std::fs::read_to_string("/sys/devices/system/cpu/cpu0/cpufreq/scaling_governor")
    else {
        return;
    };
    if governor.trim() != "performance" {
        warn!(
            "CPU scaling governor is '{}'; 'performance' gives steadier exec times",
            governor.trim()
        );
    }
}

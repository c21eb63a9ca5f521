//! CLI entry point. Wires the real collaborators (scheduler backends, SSH,
//! `nix-store`) into [`nsh::orchestrator::run`] and translates its result
//! into a process exit code.

use std::env;
use std::fs::File;
use std::os::unix::io::FromRawFd;
use std::sync::atomic::AtomicBool;

use anyhow::Context;
use clap::Parser;

use nsh::{log, orchestrator, signal};
use nsh_config::Settings;
use nsh_scheduler::{BackendConfig, RealSchedulerFactory};
use nsh_ssh::SshConnector;
use nsh_store::ShellStore;

/// The remote build hook's own descriptor convention, inherited from the
/// parent daemon: fd 4 carries the job's log stream, fd 5 a supplementary
/// diagnostic channel, both already open when the parent execs this binary.
const BUILD_LOG_FD: i32 = 4;
const ERR_CHANNEL_FD: i32 = 5;

#[derive(Parser)]
#[command(
    name = "nsh",
    version,
    about = "Remote build hook: offloads one derivation build to an HPC batch scheduler."
)]
struct Cli {
    /// Verbosity level, matching the daemon's own -v counting convention.
    verbosity: u8,
}

fn main() -> anyhow::Result<()> {
    // Matches the parent daemon's own hooks: suppress anything that might
    // try to pop up an interactive prompt on a headless build host.
    env::remove_var("DISPLAY");
    env::remove_var("SSH_ASKPASS");

    let cli = Cli::parse();
    let settings = Settings::load().context("loading configuration")?;
    signal::install();

    let level = log::level_from_verbosity(cli.verbosity);
    let verbosity_arg = cli.verbosity.to_string();
    let code = log::run_with_logger(level, |logger| run(logger, &settings, &verbosity_arg))?;

    std::process::exit(code);
}

fn run(logger: &slog::Logger, settings: &Settings, verbosity_arg: &str) -> anyhow::Result<i32> {
    let state_dir = settings.state_dir.to_string_lossy().into_owned();
    let config = BackendConfig {
        job_scheduler: settings.job_scheduler,
        state_dir: &state_dir,
        store_dir: &settings.store_dir,
        remote_nix_bin_dir: &settings.remote_nix_bin_dir,
        slurm_api_host: &settings.slurm_api_host,
        slurm_api_port: settings.slurm_api_port,
        slurm_jwt_token: &settings.slurm_jwt_token,
        slurm_extra_submission_params: &settings.slurm_extra_submission_params,
        slurm_conf: &settings.slurm_conf,
        pbs_host: &settings.pbs_host,
    };
    let scheduler_factory = RealSchedulerFactory { config };
    let remote_connector = SshConnector;
    let store = ShellStore::new();
    let cancel: &'static AtomicBool = signal::flag();

    let collaborators = orchestrator::Collaborators {
        logger,
        settings,
        verbosity_arg,
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel,
    };

    // Safety: fds 4 and 5 are part of this hook's invocation contract with
    // the parent daemon and are guaranteed open for the lifetime of the
    // process; each is taken exactly once, here.
    let build_log = unsafe { File::from_raw_fd(BUILD_LOG_FD) };
    let err_channel = unsafe { File::from_raw_fd(ERR_CHANNEL_FD) };

    let code = orchestrator::run(
        &collaborators,
        std::io::stdin(),
        std::io::stderr(),
        build_log,
        err_channel,
    )
    .context("orchestrator")?;

    Ok(code)
}

//! The top-level state machine described in SPEC_FULL.md §4.5: one
//! invocation, one derivation, ending in exactly one of the dispositions
//! enumerated in §7.
//!
//! Generic over the scheduler/remote-store/store collaborators so that
//! `crates/nsh/tests/` can drive the whole thing against in-process fakes
//! (no real scheduler, no real `ssh`, no real `nix-store`) per
//! SPEC_FULL.md §10.4, while `main.rs` instantiates it with the real
//! backends.

use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use nsh_config::Settings;
use nsh_protocol::wire::Reader;
use nsh_protocol::{BuildRequest, HeaderOutcome, LogSanitizer};
use nsh_scheduler::{Scheduler, SchedulerFactory, SubmissionTunables};
use nsh_ssh::{RemoteStore, RemoteStoreConnector, TailSource};
use nsh_store::{DrvOutput, Store};
use thiserror::Error;

use crate::upload_lock;

#[derive(Debug, Error)]
pub enum Error {
    #[error("protocol framing")]
    Protocol(#[from] nsh_protocol::wire::Error),
    #[error("fallback hook driver")]
    Fallback(#[from] nsh_fallback::Error),
    #[error("store operation")]
    Store(#[from] nsh_store::Error),
    #[error("i/o error")]
    Io(#[from] std::io::Error),
    #[error("upload lock: {0}")]
    Lock(String),
}

const TAIL_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Everything the orchestrator needs beyond the request itself, collected
/// so `run`'s signature stays a manageable handful of arguments.
pub struct Collaborators<'a, SF, RC, ST> {
    pub logger: &'a slog::Logger,
    pub settings: &'a Settings,
    pub verbosity_arg: &'a str,
    pub scheduler_factory: &'a SF,
    pub remote_connector: &'a RC,
    pub store: &'a ST,
    pub cancel: &'a AtomicBool,
}

/// Runs one invocation to completion and returns the process exit code.
#[allow(clippy::too_many_arguments)]
pub fn run<SF, RC, ST>(
    collaborators: &Collaborators<'_, SF, RC, ST>,
    stdin: impl Read,
    mut proto_out: impl Write,
    build_log: impl Write + Send + 'static,
    err_channel: impl Read,
) -> Result<i32, Error>
where
    SF: SchedulerFactory,
    RC: RemoteStoreConnector,
    ST: Store,
{
    let Collaborators {
        logger,
        settings,
        verbosity_arg,
        scheduler_factory,
        remote_connector,
        store,
        cancel,
    } = collaborators;

    let mut reader = Reader::new(stdin);
    let mut request = match nsh_protocol::read_header(&mut reader)? {
        HeaderOutcome::NotTrying => {
            slog::info!(logger, "parent did not request a build; exiting silently");
            return Ok(0);
        }
        HeaderOutcome::Try(request) => request,
    };

    slog::debug!(logger, "received build request";
        "drv" => &request.drv_path, "needed_system" => &request.needed_system);

    if !eligible(settings, &request) {
        slog::info!(logger, "not eligible for this derivation, falling back";
            "needed_system" => &request.needed_system, "configured_system" => &settings.system);
        return run_fallback(verbosity_arg, &request, &mut reader, &mut proto_out, logger);
    }

    let drv_store_path = match store.parse_store_path(&request.drv_path) {
        Ok(p) => p,
        Err(e) => {
            slog::warn!(logger, "invalid derivation path"; "error" => %e);
            return decline_permanently(&mut proto_out);
        }
    };
    let derivation = match store.read_derivation(&drv_store_path) {
        Ok(d) => d,
        Err(e) => {
            slog::warn!(logger, "failed to read derivation"; "error" => %e);
            return decline_permanently(&mut proto_out);
        }
    };
    let tunables = match nsh_config::parse_submission_overrides(&derivation.env) {
        Ok(t) => t,
        Err(e) => {
            slog::warn!(logger, "malformed submission overrides in derivation env"; "error" => %e);
            return decline_permanently(&mut proto_out);
        }
    };

    let mut scheduler = match scheduler_factory.build(&request.drv_path) {
        Ok(s) => s,
        Err(e) => {
            slog::warn!(logger, "constructing scheduler backend failed"; "error" => %e);
            return decline_permanently(&mut proto_out);
        }
    };

    if let Err(e) = scheduler.submit(&request.drv_path, &tunables) {
        slog::warn!(logger, "scheduler submission failed"; "error" => %e);
        return decline_permanently(&mut proto_out);
    }
    slog::info!(logger, "job submitted"; "job_id" => scheduler.job_id());

    let host = match scheduler.wait_for_host_assignment(cancel) {
        Ok(host) => host,
        Err(nsh_scheduler::Error::Cancelled) => {
            slog::info!(logger, "terminate requested while waiting for host assignment");
            return Ok(0);
        }
        Err(e) => {
            slog::warn!(logger, "waiting for host assignment failed"; "error" => %e);
            return decline_permanently(&mut proto_out);
        }
    };
    slog::info!(logger, "host assigned"; "host" => &host);

    let remote = match remote_connector.connect(&host) {
        Ok(r) => r,
        Err(e) => {
            slog::warn!(logger, "connecting to remote store failed"; "error" => %e, "context" => drain_context(err_channel));
            return decline(&mut proto_out);
        }
    };

    write_token(&mut proto_out, &format!("# accept\n{}\n", remote.store_uri()))?;
    slog::info!(logger, "accepted job"; "store_uri" => remote.store_uri());

    let (inputs, wanted_outputs) = reader.read_accepted_tail()?;
    request.inputs = inputs;
    request.wanted_outputs = wanted_outputs;

    let lock_outcome = upload_lock::acquire(&settings.state_dir, remote.store_uri())
        .map_err(|e| Error::Lock(e.to_string()))?;
    match &lock_outcome {
        upload_lock::LockOutcome::Held(_) => {}
        upload_lock::LockOutcome::TimedOut => {
            slog::warn!(logger, "upload lock wait timed out after 15 minutes, continuing unlocked");
        }
    }

    let input_paths: Vec<_> = request
        .inputs
        .iter()
        .filter_map(|p| store.parse_store_path(p).ok())
        .collect();
    let copy_in = store
        .copy_closure(remote.store_uri(), &input_paths, settings.builders_use_substitutes)
        .and_then(|_| {
            store.copy_paths(
                remote.store_uri(),
                &[drv_store_path.clone()],
                settings.builders_use_substitutes,
            )
        });
    if let Err(e) = copy_in {
        slog::warn!(logger, "copying inputs into remote store failed"; "error" => %e);
        return decline_permanently(&mut proto_out);
    }
    drop(lock_outcome);

    let abnormal_end = Arc::new(AtomicBool::new(false));
    let tail = remote.tail_stderr(&scheduler.scratch().job_stderr)?;
    let tail_handle = spawn_tail(tail, settings.max_log_size, build_log, Arc::clone(&abnormal_end));

    let rc = scheduler.wait_for_completion(cancel);
    let (exit_code, tail_result) = match rc {
        Ok(0) => (None, join_tail(tail_handle)),
        Ok(rc) if rc > 0 => (Some(rc), join_tail(tail_handle)),
        Ok(_) => {
            slog::warn!(logger, "job ended abnormally");
            abnormal_end.store(true, Ordering::SeqCst);
            (Some(1), join_tail(tail_handle))
        }
        Err(nsh_scheduler::Error::Cancelled) => {
            slog::info!(logger, "terminate requested while waiting for job completion");
            abnormal_end.store(true, Ordering::SeqCst);
            let _ = join_tail(tail_handle);
            return Ok(0);
        }
        Err(e) => {
            slog::warn!(logger, "waiting for job completion failed"; "error" => %e);
            abnormal_end.store(true, Ordering::SeqCst);
            (Some(1), join_tail(tail_handle))
        }
    };

    if let Err(TailError::LogLimitExceeded) = tail_result {
        slog::error!(logger, "log output exceeded configured size limit");
        return Ok(1);
    }

    if let Some(code) = exit_code {
        return Ok(code);
    }

    if let Err(e) = copy_out(store, &remote, &derivation, &request.wanted_outputs) {
        slog::error!(logger, "copying build outputs back failed"; "error" => %e);
        return Err(Error::Store(e));
    }

    slog::info!(logger, "build completed successfully");
    Ok(0)
}

fn eligible(settings: &Settings, request: &BuildRequest) -> bool {
    request.needed_system == settings.system
        && request
            .required_features
            .iter()
            .all(|f| settings.system_features.contains(f))
}

fn run_fallback<R: Read>(
    verbosity_arg: &str,
    request: &BuildRequest,
    reader: &mut Reader<R>,
    proto_out: &mut impl Write,
    logger: &slog::Logger,
) -> Result<i32, Error> {
    match nsh_fallback::locate_fallback_program() {
        Some(program) => {
            slog::debug!(logger, "spawning fallback build-remote"; "program" => program.display().to_string());
            let status = nsh_fallback::run_fallback(&program, verbosity_arg, request, reader)?;
            Ok(status.code().unwrap_or(1))
        }
        None => {
            slog::warn!(logger, "no fallback build-remote program found");
            decline(proto_out)
        }
    }
}

fn decline(proto_out: &mut impl Write) -> Result<i32, Error> {
    write_token(proto_out, "# decline\n")?;
    Ok(0)
}

fn decline_permanently(proto_out: &mut impl Write) -> Result<i32, Error> {
    write_token(proto_out, "# decline-permanently\n")?;
    Ok(0)
}

/// Writes a protocol disposition token as a raw line, never through the
/// length-prefixed wire framing and never through the structured logger
/// (SPEC_FULL.md §10.1): the parent parses this stream itself.
fn write_token(w: &mut impl Write, token: &str) -> std::io::Result<()> {
    w.write_all(token.as_bytes())?;
    w.flush()
}

fn drain_context(mut r: impl Read) -> String {
    let mut buf = [0u8; 4096];
    let n = r.read(&mut buf).unwrap_or(0);
    String::from_utf8_lossy(&buf[..n]).into_owned()
}

#[derive(Debug, Error)]
enum TailError {
    #[error("log output exceeded the configured size limit")]
    LogLimitExceeded,
    #[error("reading remote log")]
    Io(#[from] std::io::Error),
}

/// Spawns the log-tail task. It owns `tail` and `build_log` for its whole
/// lifetime; the only thing shared with the main task is `abnormal_end`.
/// Runs concurrently with the main task's `wait_for_completion` call
/// (SPEC_FULL.md §5): `run` does not join this handle until after that
/// call returns.
fn spawn_tail<T, W>(
    mut tail: T,
    max_log_size: u64,
    mut build_log: W,
    abnormal_end: Arc<AtomicBool>,
) -> thread::JoinHandle<Result<(), TailError>>
where
    T: TailSource + Send + 'static,
    W: Write + Send + 'static,
{
    thread::spawn(move || -> Result<(), TailError> {
        let mut sanitizer = LogSanitizer::new(max_log_size);
        let mut buf = [0u8; 4096];
        loop {
            match tail.read_some(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    let outcome = sanitizer
                        .feed(&buf[..n])
                        .map_err(|_| TailError::LogLimitExceeded)?;
                    for line in outcome.lines {
                        writeln!(build_log, "{line}")?;
                    }
                    if outcome.terminator_seen {
                        break;
                    }
                }
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                    if abnormal_end.load(Ordering::Relaxed) {
                        tail.kill();
                        break;
                    }
                    thread::sleep(TAIL_POLL_INTERVAL);
                }
                Err(e) => return Err(TailError::Io(e)),
            }
        }
        Ok(())
    })
}

fn join_tail(handle: thread::JoinHandle<Result<(), TailError>>) -> Result<(), TailError> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Ok(()),
    }
}

fn copy_out<ST: Store, R: RemoteStore>(
    store: &ST,
    remote: &R,
    derivation: &nsh_store::Derivation,
    wanted_outputs: &[String],
) -> Result<(), nsh_store::Error> {
    if derivation.content_addressed {
        let mut missing = Vec::new();
        for name in wanted_outputs {
            let output = DrvOutput {
                drv_hash: derivation.drv_hash.clone(),
                output_name: name.clone(),
            };
            if store.query_realisation(&output)?.is_none() {
                missing.push(output);
            }
        }
        for output in missing {
            if let Some(realisation) = store.query_realisation_from(remote.store_uri(), &output)? {
                store.copy_paths_from(remote.store_uri(), &[realisation.out_path.clone()], false)?;
                store.register_drv_output(&output, &realisation)?;
            }
            // Not yet known: leave unregistered. COPY_OUT resolves the
            // path only once the realisation is actually observed,
            // correcting the original's null-realisation dereference
            // (SPEC_FULL.md §9).
        }
    } else {
        let mut missing_paths = Vec::new();
        for name in wanted_outputs {
            if let Some(Some(path)) = derivation.outputs.get(name) {
                if !store.is_valid_path(path)? {
                    missing_paths.push(path.clone());
                }
            }
        }
        if !missing_paths.is_empty() {
            store.copy_paths_from(remote.store_uri(), &missing_paths, false)?;
        }
    }
    Ok(())
}

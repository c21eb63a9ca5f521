//! Drives the daemon's own default build-remote program when this hook
//! declines a job: locates the fallback binary, spawns it, and replays the
//! parent protocol toward it verbatim.

use std::env;
use std::io::{BufRead, BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::mpsc;
use std::thread;

use nsh_protocol::wire::Reader;
use nsh_protocol::BuildRequest;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("could not locate a fallback build-remote program")]
    NotFound,
    #[error("spawning fallback program {path:?}")]
    Spawn {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("writing protocol to fallback program")]
    Protocol(#[from] nsh_protocol::wire::Error),
    #[error("waiting for fallback program")]
    Wait(#[source] std::io::Error),
}

/// Resolves the fallback program, preferring `$NIX_BIN_DIR/nix`, falling
/// back to scanning `$PATH` for a `nix` executable and deriving its
/// libexec sibling.
pub fn locate_fallback_program() -> Option<PathBuf> {
    if let Ok(bin_dir) = env::var("NIX_BIN_DIR") {
        let primary = Path::new(&bin_dir).join("nix");
        if primary.is_file() {
            return Some(primary);
        }
        let libexec = Path::new(&bin_dir).join("../libexec/nix/build-remote");
        if libexec.is_file() {
            return Some(libexec);
        }
        return None;
    }

    let path_var = env::var("PATH").ok()?;
    for dir in env::split_paths(&path_var) {
        let candidate = dir.join("nix");
        if candidate.is_file() {
            let resolved = std::fs::canonicalize(&candidate).unwrap_or(candidate.clone());
            if let Some(bin_dir) = resolved.parent() {
                if let Some(prefix) = bin_dir.parent() {
                    let libexec = prefix.join("libexec/nix/build-remote");
                    if libexec.is_file() {
                        return Some(libexec);
                    }
                }
            }
            return Some(candidate);
        }
    }
    None
}

enum ChildDecision {
    Accept,
    Decline,
}

/// Spawns the fallback program, replays the header toward it, then waits
/// to see whether the child accepts or declines before deciding whether to
/// relay `inputs`/`wantedOutputs` from the real parent. Every line the
/// child writes to its own stderr is forwarded to our stderr so the real
/// parent sees exactly what it would have from a direct invocation.
pub fn run_fallback<R: Read>(
    program: &Path,
    verbosity: &str,
    request: &BuildRequest,
    parent_reader: &mut Reader<R>,
) -> Result<ExitStatus, Error> {
    let is_nix_wrapper = program.file_name().and_then(|n| n.to_str()) == Some("nix");
    let mut command = Command::new(program);
    if is_nix_wrapper {
        command.arg("__build-remote").arg(verbosity);
    } else {
        command.arg(verbosity);
    }
    let mut child = command
        .stdin(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|source| Error::Spawn {
            path: program.to_path_buf(),
            source,
        })?;

    let child_stderr = child.stderr.take().expect("piped stderr");
    let (decision_tx, decision_rx) = mpsc::channel();
    let stderr_thread = thread::spawn(move || {
        let mut reader = BufReader::new(child_stderr);
        let mut sent_decision = false;
        let mut line = String::new();
        loop {
            line.clear();
            match reader.read_line(&mut line) {
                Ok(0) => break,
                Ok(_) => {
                    eprint!("{line}");
                    if !sent_decision {
                        if line.starts_with("# accept") {
                            sent_decision = true;
                            let _ = decision_tx.send(ChildDecision::Accept);
                        } else if line.starts_with("# decline") {
                            sent_decision = true;
                            let _ = decision_tx.send(ChildDecision::Decline);
                        }
                    }
                }
                Err(_) => break,
            }
        }
    });

    {
        let stdin = child.stdin.as_mut().expect("piped stdin");
        let mut writer = nsh_protocol::wire::Writer::new(stdin);
        writer.write_settings(&request.inherited_settings)?;
        writer.write_string("try")?;
        writer.write_u64(request.am_willing)?;
        writer.write_string(&request.needed_system)?;
        writer.write_string(&request.drv_path)?;
        writer.write_string_list(&request.required_features)?;
        writer.flush()?;
    }

    if let Ok(ChildDecision::Accept) = decision_rx.recv() {
        let (inputs, wanted_outputs) = parent_reader.read_accepted_tail()?;
        let stdin = child.stdin.as_mut().expect("piped stdin");
        let mut writer = nsh_protocol::wire::Writer::new(stdin);
        writer.write_string_list(&inputs)?;
        writer.write_string_list(&wanted_outputs)?;
        writer.flush()?;
    }

    // Dropping stdin closes the pipe so the child observes EOF if it is
    // still waiting on more input (e.g. it declined and needs nothing
    // further).
    child.stdin = None;

    let status = child.wait().map_err(Error::Wait)?;
    let _ = stderr_thread.join();
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn locate_returns_none_when_nix_bin_dir_missing_and_not_on_path() {
        let original_bin_dir = env::var("NIX_BIN_DIR").ok();
        let original_path = env::var("PATH").ok();
        env::remove_var("NIX_BIN_DIR");
        env::set_var("PATH", "");

        assert!(locate_fallback_program().is_none());

        if let Some(v) = original_bin_dir {
            env::set_var("NIX_BIN_DIR", v);
        }
        if let Some(v) = original_path {
            env::set_var("PATH", v);
        }
    }
}

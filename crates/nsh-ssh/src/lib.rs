//! Thin wrapper over the `ssh` command line: a generic remote command
//! runner, and a remote store handle opened against the compute node the
//! scheduler assigned.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Child, ChildStdout, Command, Stdio};

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("spawning ssh")]
    Spawn(#[source] std::io::Error),
    #[error("ssh command exited with status {status}: {stderr}")]
    CommandFailed { status: i32, stderr: String },
    #[error("connecting to {host}")]
    Connect {
        host: String,
        #[source]
        source: Box<Error>,
    },
}

/// Runs commands on one remote host over `ssh`, reusing one master
/// connection's control socket semantics via ssh's own `ControlMaster`
/// handling (configured in the user's ssh config, not duplicated here).
#[derive(Clone, Debug)]
pub struct SshCommandRunner {
    ssh_bin: PathBuf,
    host: String,
}

impl SshCommandRunner {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            ssh_bin: PathBuf::from("ssh"),
            host: host.into(),
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Runs `remote_command` and waits for it to finish, capturing output.
    pub fn run(&self, remote_command: &str) -> Result<String, Error> {
        let output = Command::new(&self.ssh_bin)
            .arg(&self.host)
            .arg(remote_command)
            .output()
            .map_err(Error::Spawn)?;
        if !output.status.success() {
            return Err(Error::CommandFailed {
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Spawns `remote_command` without waiting, with stdout piped back.
    /// Used for long-lived commands such as `tail -f`.
    pub fn spawn_piped(&self, remote_command: &str) -> Result<Child, Error> {
        Command::new(&self.ssh_bin)
            .arg(&self.host)
            .arg(remote_command)
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(Error::Spawn)
    }
}

/// An open connection to the remote node's store, obtained after the
/// scheduler has assigned a compute node.
pub struct RemoteStoreHandle {
    runner: SshCommandRunner,
    store_uri: String,
}

impl RemoteStoreHandle {
    /// Connects to `host` and verifies reachability. `store_dir` is the
    /// remote store directory prefix (usually `/nix/store`); it only
    /// affects the returned store URI, not the connectivity check.
    pub fn connect(host: &str) -> Result<Self, Error> {
        let runner = SshCommandRunner::new(host);
        runner.run("true").map_err(|source| Error::Connect {
            host: host.to_string(),
            source: Box::new(source),
        })?;
        Ok(Self {
            store_uri: format!("ssh-ng://{host}"),
            runner,
        })
    }

    pub fn store_uri(&self) -> &str {
        &self.store_uri
    }

    pub fn host(&self) -> &str {
        self.runner.host()
    }

    /// Removes the scratch files created on the remote node for this job,
    /// per SPEC_FULL.md's scratch-file convention. Idempotent: `rm -fv`
    /// does not fail on a missing file.
    pub fn remove_scratch_files(&self, paths: &[String]) -> Result<(), Error> {
        let quoted: Vec<String> = paths.iter().map(|p| shell_quote(p)).collect();
        let command = format!("rm -fv {}", quoted.join(" "));
        self.runner.run(&command)?;
        Ok(())
    }

    /// Starts tailing `remote_path` from its beginning. Returns a handle
    /// whose stdout yields new bytes as the remote file grows. The
    /// descriptor is put in non-blocking mode so the tail task can poll it
    /// cooperatively instead of being stuck in a blocking read past the
    /// point the orchestrator wants to stop waiting (SPEC_FULL.md §5/§9).
    pub fn tail_stderr(&self, remote_path: &str) -> Result<TailHandle, Error> {
        let command = format!("tail -f -c +1 {}", shell_quote(remote_path));
        let mut child = self.runner.spawn_piped(&command)?;
        let stdout = child.stdout.take();
        if let Some(stdout) = &stdout {
            set_nonblocking(stdout)?;
        }
        Ok(TailHandle { child, stdout })
    }
}

fn set_nonblocking(stdout: &ChildStdout) -> Result<(), Error> {
    use std::os::unix::io::AsRawFd;
    let fd = stdout.as_raw_fd();
    unsafe {
        let flags = libc::fcntl(fd, libc::F_GETFL, 0);
        if flags < 0 || libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
            return Err(Error::Spawn(std::io::Error::last_os_error()));
        }
    }
    Ok(())
}

pub struct TailHandle {
    child: Child,
    stdout: Option<ChildStdout>,
}

impl TailHandle {
    /// Reads whatever bytes are currently available. Returns `0` on EOF,
    /// or an `ErrorKind::WouldBlock` error (never blocks) when the remote
    /// process has not produced more output yet.
    pub fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        match self.stdout.as_mut() {
            Some(stdout) => stdout.read(buf),
            None => Ok(0),
        }
    }

    pub fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill()
    }
}

impl Drop for TailHandle {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\\''"))
}

/// A byte source the log-tail task drains. Implemented by [`TailHandle`]
/// in production; orchestrator tests substitute an in-memory fake that
/// hands back a scripted byte sequence without spawning `ssh`.
pub trait TailSource {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize>;

    /// Stops the underlying process, if any. Called by the tail task
    /// itself once it observes the orchestrator's abnormal-end flag, so it
    /// can fall out of its poll loop promptly instead of waiting for the
    /// remote `tail -f` to notice the job is gone on its own.
    fn kill(&mut self) {}
}

impl TailSource for TailHandle {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        TailHandle::read_some(self, buf)
    }

    fn kill(&mut self) {
        let _ = TailHandle::kill(self);
    }
}

/// The remote-store capability set the orchestrator drives after the
/// scheduler assigns a compute node. Implemented by [`RemoteStoreHandle`]
/// in production; a test seam so the orchestrator can be driven without a
/// real SSH subprocess.
pub trait RemoteStore {
    type Tail: TailSource;
    fn store_uri(&self) -> &str;
    fn host(&self) -> &str;
    fn remove_scratch_files(&self, paths: &[String]) -> Result<(), Error>;
    fn tail_stderr(&self, remote_path: &str) -> Result<Self::Tail, Error>;
}

impl RemoteStore for RemoteStoreHandle {
    type Tail = TailHandle;
    fn store_uri(&self) -> &str {
        RemoteStoreHandle::store_uri(self)
    }
    fn host(&self) -> &str {
        RemoteStoreHandle::host(self)
    }
    fn remove_scratch_files(&self, paths: &[String]) -> Result<(), Error> {
        RemoteStoreHandle::remove_scratch_files(self, paths)
    }
    fn tail_stderr(&self, remote_path: &str) -> Result<TailHandle, Error> {
        RemoteStoreHandle::tail_stderr(self, remote_path)
    }
}

/// Connects to the compute node the scheduler assigned. Production uses
/// [`RemoteStoreHandle::connect`]; tests substitute a connector that
/// returns a fake without touching the network.
pub trait RemoteStoreConnector {
    type Handle: RemoteStore;
    fn connect(&self, host: &str) -> Result<Self::Handle, Error>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SshConnector;

impl RemoteStoreConnector for SshConnector {
    type Handle = RemoteStoreHandle;
    fn connect(&self, host: &str) -> Result<RemoteStoreHandle, Error> {
        RemoteStoreHandle::connect(host)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shell_quote_escapes_single_quotes() {
        assert_eq!(shell_quote("abc"), "'abc'");
        assert_eq!(shell_quote("a'b"), "'a'\\''b'");
    }
}

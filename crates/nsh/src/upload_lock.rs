//! The per-`storeURI` advisory lock serialising the upload stage (see
//! SPEC_FULL.md's `UploadLock` entity and the `LOCK` orchestrator step).

use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use fs2::FileExt;
use md5::{Digest, Md5};

const NAME_MAX: usize = 255;
const WAIT_BOUND: Duration = Duration::from_secs(15 * 60);

pub struct UploadLock {
    file: File,
}

impl Drop for UploadLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}

pub enum LockOutcome {
    Held(UploadLock),
    TimedOut,
}

/// Acquires the exclusive lock for `store_uri`, bounded by a 15-minute
/// wait. On timeout, the caller proceeds without the lock (the original's
/// `SIGALRM`-bounded wait, reimplemented cooperatively).
pub fn acquire(state_dir: &Path, store_uri: &str) -> anyhow::Result<LockOutcome> {
    let dir = state_dir.join("current-load");
    fs::create_dir_all(&dir)?;
    let path = lock_path(&dir, store_uri);
    let file = OpenOptions::new().create(true).write(true).open(&path)?;

    let (tx, rx) = mpsc::channel();
    let lock_file = file.try_clone()?;
    thread::spawn(move || {
        let _ = lock_file.lock_exclusive();
        let _ = tx.send(());
    });

    match rx.recv_timeout(WAIT_BOUND) {
        Ok(()) => Ok(LockOutcome::Held(UploadLock { file })),
        Err(mpsc::RecvTimeoutError::Timeout) => Ok(LockOutcome::TimedOut),
        Err(mpsc::RecvTimeoutError::Disconnected) => Ok(LockOutcome::TimedOut),
    }
}

fn lock_path(dir: &Path, store_uri: &str) -> PathBuf {
    let escaped = escape_uri(store_uri);
    let filename = format!("{escaped}.upload-lock");
    if filename.len() <= NAME_MAX {
        return dir.join(filename);
    }
    let mut hasher = Md5::new();
    hasher.update(store_uri.as_bytes());
    let digest = hasher.finalize();
    let encoded = base64_no_padding(&digest);
    dir.join(format!("{encoded}.upload-lock"))
}

fn escape_uri(store_uri: &str) -> String {
    store_uri
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '.' { c } else { '_' })
        .collect()
}

fn base64_no_padding(bytes: &[u8]) -> String {
    const ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789+/";
    let mut out = String::new();
    for chunk in bytes.chunks(3) {
        let b0 = chunk[0] as u32;
        let b1 = *chunk.get(1).unwrap_or(&0) as u32;
        let b2 = *chunk.get(2).unwrap_or(&0) as u32;
        let n = (b0 << 16) | (b1 << 8) | b2;
        out.push(ALPHABET[((n >> 18) & 0x3f) as usize] as char);
        out.push(ALPHABET[((n >> 12) & 0x3f) as usize] as char);
        if chunk.len() > 1 {
            out.push(ALPHABET[((n >> 6) & 0x3f) as usize] as char);
        }
        if chunk.len() > 2 {
            out.push(ALPHABET[(n & 0x3f) as usize] as char);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_uri_keeps_escaped_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = lock_path(dir.path(), "ssh-ng://node1");
        assert_eq!(path.file_name().unwrap().to_str().unwrap(), "ssh-ng___node1.upload-lock");
    }

    #[test]
    fn overlong_uri_falls_back_to_md5() {
        let dir = tempfile::tempdir().unwrap();
        let long_uri = format!("ssh-ng://{}", "a".repeat(300));
        let path = lock_path(dir.path(), &long_uri);
        let name = path.file_name().unwrap().to_str().unwrap();
        assert!(name.len() < NAME_MAX);
        assert!(name.ends_with(".upload-lock"));
    }

    #[test]
    fn acquire_then_acquire_again_after_drop_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = acquire(dir.path(), "ssh-ng://node1").unwrap();
        let held = matches!(outcome, LockOutcome::Held(_));
        assert!(held);
        drop(outcome);
        let outcome2 = acquire(dir.path(), "ssh-ng://node1").unwrap();
        assert!(matches!(outcome2, LockOutcome::Held(_)));
    }
}

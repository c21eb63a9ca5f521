//! Drives `nsh::orchestrator::run` against in-process fakes for the
//! `Scheduler`/`RemoteStore`/`Store` collaborators: no real batch
//! scheduler, no `ssh`, no `nix-store`.

use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{Cursor, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use nsh::orchestrator::{self, Collaborators};
use nsh_config::{JobScheduler, Settings, SubmissionTunables};
use nsh_protocol::wire::Writer;
use nsh_scheduler::{Scheduler, SchedulerFactory, ScratchPaths};
use nsh_ssh::{RemoteStore, RemoteStoreConnector, TailSource};
use nsh_store::{Derivation, DrvOutput, Realisation, Store, StorePath};

fn encode_request(
    needed_system: &str,
    drv_path: &str,
    inputs: &[&str],
    wanted_outputs: &[&str],
) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut w = Writer::new(&mut buf);
    w.write_settings(&[]).unwrap();
    w.write_string("try").unwrap();
    w.write_u64(1).unwrap();
    w.write_string(needed_system).unwrap();
    w.write_string(drv_path).unwrap();
    w.write_string_list(&[]).unwrap();
    w.write_string_list(&inputs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .unwrap();
    w.write_string_list(&wanted_outputs.iter().map(|s| s.to_string()).collect::<Vec<_>>())
        .unwrap();
    w.flush().unwrap();
    buf
}

fn test_settings(state_dir: &std::path::Path) -> Settings {
    Settings {
        job_scheduler: JobScheduler::Slurm,
        system: "x86_64-linux".to_string(),
        state_dir: state_dir.to_path_buf(),
        ..Settings::default()
    }
}

#[derive(Clone, Default)]
struct SharedBuf(Arc<Mutex<Vec<u8>>>);

impl SharedBuf {
    fn contents(&self) -> Vec<u8> {
        self.0.lock().unwrap().clone()
    }
}

impl Write for SharedBuf {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

struct FakeScheduler {
    job_id: Option<String>,
    submit_result: Option<Result<(), nsh_scheduler::Error>>,
    host_result: Option<Result<String, nsh_scheduler::Error>>,
    completion_result: Option<Result<i32, nsh_scheduler::Error>>,
    scratch: ScratchPaths,
    live: bool,
    cancel_called: Arc<AtomicBool>,
}

impl Scheduler for FakeScheduler {
    fn submit(&mut self, _drv_path: &str, _tunables: &SubmissionTunables) -> Result<(), nsh_scheduler::Error> {
        self.submit_result.take().unwrap_or(Ok(()))
    }
    fn job_id(&self) -> Option<String> {
        self.job_id.clone()
    }
    fn wait_for_host_assignment(&mut self, _cancel: &AtomicBool) -> Result<String, nsh_scheduler::Error> {
        self.host_result.take().expect("host_result set for this scenario")
    }
    fn wait_for_completion(&mut self, _cancel: &AtomicBool) -> Result<i32, nsh_scheduler::Error> {
        self.completion_result.take().expect("completion_result set for this scenario")
    }
    fn is_live(&self) -> bool {
        self.live
    }
    fn cancel_if_live(&mut self) -> Result<(), nsh_scheduler::Error> {
        self.cancel_called.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn scratch(&self) -> &ScratchPaths {
        &self.scratch
    }
}

struct FakeSchedulerFactory {
    scheduler: RefCell<Option<FakeScheduler>>,
}

impl SchedulerFactory for FakeSchedulerFactory {
    type Handle = FakeScheduler;
    fn build(&self, _drv_path: &str) -> Result<FakeScheduler, nsh_scheduler::Error> {
        self.scheduler
            .borrow_mut()
            .take()
            .ok_or_else(|| nsh_scheduler::Error::Submission("factory called twice".to_string()))
    }
}

struct FakeTail {
    data: Vec<u8>,
    served: bool,
}

impl TailSource for FakeTail {
    fn read_some(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.served {
            return Ok(0);
        }
        self.served = true;
        let n = self.data.len().min(buf.len());
        buf[..n].copy_from_slice(&self.data[..n]);
        Ok(n)
    }
}

struct FakeRemoteStore {
    store_uri: String,
    host: String,
    tail_data: Vec<u8>,
    scratch_removed: Arc<AtomicBool>,
}

impl RemoteStore for FakeRemoteStore {
    type Tail = FakeTail;
    fn store_uri(&self) -> &str {
        &self.store_uri
    }
    fn host(&self) -> &str {
        &self.host
    }
    fn remove_scratch_files(&self, _paths: &[String]) -> Result<(), nsh_ssh::Error> {
        self.scratch_removed.store(true, Ordering::SeqCst);
        Ok(())
    }
    fn tail_stderr(&self, _remote_path: &str) -> Result<FakeTail, nsh_ssh::Error> {
        Ok(FakeTail {
            data: self.tail_data.clone(),
            served: false,
        })
    }
}

struct FakeConnector {
    remote: RefCell<Option<FakeRemoteStore>>,
}

impl RemoteStoreConnector for FakeConnector {
    type Handle = FakeRemoteStore;
    fn connect(&self, _host: &str) -> Result<FakeRemoteStore, nsh_ssh::Error> {
        self.remote.borrow_mut().take().ok_or(nsh_ssh::Error::Spawn(std::io::Error::new(
            std::io::ErrorKind::Other,
            "connect called twice",
        )))
    }
}

#[derive(Clone)]
struct FakeStore {
    copy_closure_called: Arc<AtomicBool>,
    copy_paths_called: Arc<AtomicBool>,
    copy_paths_from_called: Arc<AtomicBool>,
}

impl Default for FakeStore {
    fn default() -> Self {
        Self {
            copy_closure_called: Arc::new(AtomicBool::new(false)),
            copy_paths_called: Arc::new(AtomicBool::new(false)),
            copy_paths_from_called: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Store for FakeStore {
    fn parse_store_path(&self, s: &str) -> Result<StorePath, nsh_store::Error> {
        if s.starts_with('/') {
            Ok(StorePath(s.to_string()))
        } else {
            Err(nsh_store::Error::InvalidStorePath { path: s.to_string() })
        }
    }

    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, nsh_store::Error> {
        let mut outputs = BTreeMap::new();
        outputs.insert("out".to_string(), Some(StorePath(format!("{}-out", path.as_str()))));
        Ok(Derivation {
            env: BTreeMap::new(),
            outputs,
            content_addressed: false,
            drv_hash: "abc123".to_string(),
        })
    }

    fn is_valid_path(&self, _path: &StorePath) -> Result<bool, nsh_store::Error> {
        Ok(false)
    }

    fn query_realisation(&self, _output: &DrvOutput) -> Result<Option<Realisation>, nsh_store::Error> {
        Ok(None)
    }

    fn query_realisation_from(
        &self,
        _store_uri: &str,
        _output: &DrvOutput,
    ) -> Result<Option<Realisation>, nsh_store::Error> {
        Ok(None)
    }

    fn register_drv_output(&self, _output: &DrvOutput, _realisation: &Realisation) -> Result<(), nsh_store::Error> {
        Ok(())
    }

    fn copy_closure(&self, _dest: &str, _roots: &[StorePath], _use_substitutes: bool) -> Result<(), nsh_store::Error> {
        self.copy_closure_called.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn copy_paths(&self, _dest: &str, _paths: &[StorePath], _use_substitutes: bool) -> Result<(), nsh_store::Error> {
        self.copy_paths_called.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn copy_paths_from(&self, _src: &str, _paths: &[StorePath], _use_substitutes: bool) -> Result<(), nsh_store::Error> {
        self.copy_paths_from_called.store(true, Ordering::SeqCst);
        Ok(())
    }
}

fn test_logger() -> slog::Logger {
    slog::Logger::root(slog::Discard, slog::o!())
}

#[test]
fn happy_path_accepts_tails_log_and_copies_out() {
    let state_dir = tempfile::tempdir().unwrap();
    let settings = test_settings(state_dir.path());
    let logger = test_logger();
    let cancel = AtomicBool::new(false);

    let stdin = encode_request("x86_64-linux", "/nix/store/abc123-foo.drv", &[], &["out"]);

    let scheduler_factory = FakeSchedulerFactory {
        scheduler: RefCell::new(Some(FakeScheduler {
            job_id: Some("42".to_string()),
            submit_result: Some(Ok(())),
            host_result: Some(Ok("node1".to_string())),
            completion_result: Some(Ok(0)),
            scratch: ScratchPaths {
                root_path: "/state/job.root".to_string(),
                job_stderr: "/state/job.stderr".to_string(),
            },
            live: false,
            cancel_called: Arc::new(AtomicBool::new(false)),
        })),
    };
    let scratch_removed = Arc::new(AtomicBool::new(false));
    let remote_connector = FakeConnector {
        remote: RefCell::new(Some(FakeRemoteStore {
            store_uri: "ssh-ng://node1".to_string(),
            host: "node1".to_string(),
            tail_data: b"build log line\n@nsh done\n".to_vec(),
            scratch_removed,
        })),
    };
    let store = FakeStore::default();

    let collaborators = Collaborators {
        logger: &logger,
        settings: &settings,
        verbosity_arg: "1",
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel: &cancel,
    };

    let mut proto_out = Vec::new();
    let build_log = SharedBuf::default();

    let code = orchestrator::run(
        &collaborators,
        Cursor::new(stdin),
        &mut proto_out,
        build_log.clone(),
        std::io::empty(),
    )
    .unwrap();

    assert_eq!(code, 0);
    let proto_text = String::from_utf8(proto_out).unwrap();
    assert_eq!(proto_text, "# accept\nssh-ng://node1\n");
    assert_eq!(build_log.contents(), b"build log line\n");
    assert!(store.copy_closure_called.load(Ordering::SeqCst));
    assert!(store.copy_paths_called.load(Ordering::SeqCst));
    assert!(store.copy_paths_from_called.load(Ordering::SeqCst));
}

#[test]
fn system_mismatch_without_fallback_program_declines() {
    let state_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(state_dir.path());
    settings.system = "x86_64-linux".to_string();
    let logger = test_logger();
    let cancel = AtomicBool::new(false);

    // Force nsh_fallback::locate_fallback_program() to find nothing.
    std::env::remove_var("NIX_BIN_DIR");
    std::env::set_var("PATH", "");

    let stdin = encode_request("aarch64-darwin", "/nix/store/abc123-foo.drv", &[], &["out"]);

    let scheduler_factory = FakeSchedulerFactory { scheduler: RefCell::new(None) };
    let remote_connector = FakeConnector { remote: RefCell::new(None) };
    let store = FakeStore::default();

    let collaborators = Collaborators {
        logger: &logger,
        settings: &settings,
        verbosity_arg: "1",
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel: &cancel,
    };

    let mut proto_out = Vec::new();
    let code = orchestrator::run(
        &collaborators,
        Cursor::new(stdin),
        &mut proto_out,
        SharedBuf::default(),
        std::io::empty(),
    )
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(String::from_utf8(proto_out).unwrap(), "# decline\n");
}

#[test]
fn scheduler_submission_failure_declines_permanently() {
    let state_dir = tempfile::tempdir().unwrap();
    let settings = test_settings(state_dir.path());
    let logger = test_logger();
    let cancel = AtomicBool::new(false);

    let stdin = encode_request("x86_64-linux", "/nix/store/abc123-foo.drv", &[], &["out"]);

    let scheduler_factory = FakeSchedulerFactory {
        scheduler: RefCell::new(Some(FakeScheduler {
            job_id: None,
            submit_result: Some(Err(nsh_scheduler::Error::AuthenticationFailure)),
            host_result: None,
            completion_result: None,
            scratch: ScratchPaths {
                root_path: "/state/job.root".to_string(),
                job_stderr: "/state/job.stderr".to_string(),
            },
            live: false,
            cancel_called: Arc::new(AtomicBool::new(false)),
        })),
    };
    let remote_connector = FakeConnector { remote: RefCell::new(None) };
    let store = FakeStore::default();

    let collaborators = Collaborators {
        logger: &logger,
        settings: &settings,
        verbosity_arg: "1",
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel: &cancel,
    };

    let mut proto_out = Vec::new();
    let code = orchestrator::run(
        &collaborators,
        Cursor::new(stdin),
        &mut proto_out,
        SharedBuf::default(),
        std::io::empty(),
    )
    .unwrap();

    assert_eq!(code, 0);
    assert_eq!(String::from_utf8(proto_out).unwrap(), "# decline-permanently\n");
}

#[test]
fn log_cap_exceeded_aborts_with_exit_1() {
    let state_dir = tempfile::tempdir().unwrap();
    let mut settings = test_settings(state_dir.path());
    settings.max_log_size = 16;
    let logger = test_logger();
    let cancel = AtomicBool::new(false);

    let stdin = encode_request("x86_64-linux", "/nix/store/abc123-foo.drv", &[], &["out"]);

    let scheduler_factory = FakeSchedulerFactory {
        scheduler: RefCell::new(Some(FakeScheduler {
            job_id: Some("42".to_string()),
            submit_result: Some(Ok(())),
            host_result: Some(Ok("node1".to_string())),
            completion_result: Some(Ok(0)),
            scratch: ScratchPaths {
                root_path: "/state/job.root".to_string(),
                job_stderr: "/state/job.stderr".to_string(),
            },
            live: false,
            cancel_called: Arc::new(AtomicBool::new(false)),
        })),
    };
    let remote_connector = FakeConnector {
        remote: RefCell::new(Some(FakeRemoteStore {
            store_uri: "ssh-ng://node1".to_string(),
            host: "node1".to_string(),
            tail_data: vec![b'x'; 32],
            scratch_removed: Arc::new(AtomicBool::new(false)),
        })),
    };
    let store = FakeStore::default();

    let collaborators = Collaborators {
        logger: &logger,
        settings: &settings,
        verbosity_arg: "1",
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel: &cancel,
    };

    let mut proto_out = Vec::new();
    let code = orchestrator::run(
        &collaborators,
        Cursor::new(stdin),
        &mut proto_out,
        SharedBuf::default(),
        std::io::empty(),
    )
    .unwrap();

    assert_eq!(code, 1);
}

#[test]
fn abnormal_job_end_drains_tail_and_exits_1() {
    let state_dir = tempfile::tempdir().unwrap();
    let settings = test_settings(state_dir.path());
    let logger = test_logger();
    let cancel = AtomicBool::new(false);

    let stdin = encode_request("x86_64-linux", "/nix/store/abc123-foo.drv", &[], &["out"]);

    let scheduler_factory = FakeSchedulerFactory {
        scheduler: RefCell::new(Some(FakeScheduler {
            job_id: Some("42".to_string()),
            submit_result: Some(Ok(())),
            host_result: Some(Ok("node1".to_string())),
            completion_result: Some(Ok(-1)),
            scratch: ScratchPaths {
                root_path: "/state/job.root".to_string(),
                job_stderr: "/state/job.stderr".to_string(),
            },
            live: false,
            cancel_called: Arc::new(AtomicBool::new(false)),
        })),
    };
    let remote_connector = FakeConnector {
        remote: RefCell::new(Some(FakeRemoteStore {
            store_uri: "ssh-ng://node1".to_string(),
            host: "node1".to_string(),
            tail_data: b"partial line before the job died\n".to_vec(),
            scratch_removed: Arc::new(AtomicBool::new(false)),
        })),
    };
    let store = FakeStore::default();

    let collaborators = Collaborators {
        logger: &logger,
        settings: &settings,
        verbosity_arg: "1",
        scheduler_factory: &scheduler_factory,
        remote_connector: &remote_connector,
        store: &store,
        cancel: &cancel,
    };

    let mut proto_out = Vec::new();
    let build_log = SharedBuf::default();
    let code = orchestrator::run(
        &collaborators,
        Cursor::new(stdin),
        &mut proto_out,
        build_log.clone(),
        std::io::empty(),
    )
    .unwrap();

    assert_eq!(code, 1);
    assert_eq!(build_log.contents(), b"partial line before the job died\n");
}

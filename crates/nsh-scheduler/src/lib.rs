//! The scheduler abstraction: a closed set of backends (Slurm REST, Slurm
//! native, PBS, DRMAA grid) behind one shared capability set. Dispatch is a
//! top-level `match` over an enum rather than `Box<dyn Scheduler>`, since
//! the variant set is fixed at compile time and each backend carries
//! disjoint connection state.

pub mod backoff;
mod error;
pub mod scratch;
pub mod slurm_rest;

#[cfg(feature = "slurm-native")]
pub mod slurm_native;
#[cfg(feature = "pbs")]
pub mod pbs;
#[cfg(feature = "drmaa")]
pub mod drmaa;

pub use error::Error;
pub use nsh_config::{JobScheduler, SubmissionTunables};
pub use scratch::ScratchPaths;

use std::sync::atomic::AtomicBool;

use nsh_ssh::SshCommandRunner;

/// One submitted build job's scheduler-side state, for exactly one
/// derivation. Dropping it cancels the job if it is still live and removes
/// its remote scratch files, per SPEC_FULL.md §4.2.
pub struct SchedulerHandle {
    backend: Backend,
    scratch: ScratchPaths,
    host: Option<String>,
}

enum Backend {
    SlurmRest(slurm_rest::SlurmRest),
    #[cfg(feature = "slurm-native")]
    SlurmNative(slurm_native::SlurmNative),
    #[cfg(feature = "pbs")]
    Pbs(pbs::Pbs),
    #[cfg(feature = "drmaa")]
    Drmaa(drmaa::Drmaa),
}

/// Construction-time configuration, assembled by the orchestrator from
/// `nsh_config::Settings`.
pub struct BackendConfig<'a> {
    pub job_scheduler: JobScheduler,
    pub state_dir: &'a str,
    pub store_dir: &'a str,
    pub remote_nix_bin_dir: &'a str,
    pub slurm_api_host: &'a str,
    pub slurm_api_port: u16,
    pub slurm_jwt_token: &'a str,
    pub slurm_extra_submission_params: &'a serde_json::Value,
    pub slurm_conf: &'a str,
    pub pbs_host: &'a str,
}

impl SchedulerHandle {
    pub fn new(config: &BackendConfig<'_>, drv_path: &str) -> Result<Self, Error> {
        let scratch = scratch::scratch_paths(config.state_dir, drv_path);
        let backend = match config.job_scheduler {
            JobScheduler::Slurm => Backend::SlurmRest(slurm_rest::SlurmRest::new(slurm_rest::SlurmRestConfig {
                host: config.slurm_api_host.to_string(),
                port: config.slurm_api_port,
                token: config.slurm_jwt_token.to_string(),
                store_dir: config.store_dir.to_string(),
                remote_nix_bin_dir: config.remote_nix_bin_dir.to_string(),
            })),
            #[cfg(feature = "slurm-native")]
            JobScheduler::SlurmNative => Backend::SlurmNative(slurm_native::SlurmNative::new(
                slurm_native::SlurmNativeConfig {
                    conf_file: config.slurm_conf.to_string(),
                    store_dir: config.store_dir.to_string(),
                    remote_nix_bin_dir: config.remote_nix_bin_dir.to_string(),
                },
            )),
            #[cfg(not(feature = "slurm-native"))]
            JobScheduler::SlurmNative => return Err(Error::BackendUnavailable("slurm-native")),
            #[cfg(feature = "pbs")]
            JobScheduler::Pbs => Backend::Pbs(pbs::Pbs::new(pbs::PbsConfig {
                host: config.pbs_host.to_string(),
                store_dir: config.store_dir.to_string(),
                remote_nix_bin_dir: config.remote_nix_bin_dir.to_string(),
            })?),
            #[cfg(not(feature = "pbs"))]
            JobScheduler::Pbs => return Err(Error::BackendUnavailable("pbs")),
            #[cfg(feature = "drmaa")]
            JobScheduler::Grid => Backend::Drmaa(drmaa::Drmaa::new(drmaa::DrmaaConfig {
                store_dir: config.store_dir.to_string(),
                remote_nix_bin_dir: config.remote_nix_bin_dir.to_string(),
            })?),
            #[cfg(not(feature = "drmaa"))]
            JobScheduler::Grid => return Err(Error::BackendUnavailable("grid")),
        };
        Ok(Self {
            backend,
            scratch,
            host: None,
        })
    }

    pub fn scratch(&self) -> &ScratchPaths {
        &self.scratch
    }

    pub fn submit(&mut self, drv_path: &str, tunables: &SubmissionTunables) -> Result<(), Error> {
        match &mut self.backend {
            Backend::SlurmRest(b) => {
                let params: serde_json::Map<String, serde_json::Value> =
                    tunables.extra_slurm_params.clone().into_iter().collect();
                b.submit(drv_path, &self.scratch, &serde_json::Value::Object(params))
            }
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.submit(
                drv_path,
                &self.scratch,
                tunables.slurm_native_constraints.cpus,
                tunables.slurm_native_constraints.mem_per_node,
            ),
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => {
                let resources: Vec<(String, String)> = tunables.pbs_resources.clone().into_iter().collect();
                b.submit(drv_path, &self.scratch, &resources)
            }
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.submit(drv_path, &self.scratch),
        }
    }

    pub fn job_id(&self) -> Option<String> {
        match &self.backend {
            Backend::SlurmRest(b) => b.job_id(),
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.job_id(),
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => b.job_id(),
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.job_id(),
        }
    }

    pub fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        let host = match &mut self.backend {
            Backend::SlurmRest(b) => b.wait_for_host_assignment(cancel)?,
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.wait_for_host_assignment(cancel)?,
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => b.wait_for_host_assignment(cancel)?,
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.wait_for_host_assignment(cancel)?,
        };
        self.host = Some(host.clone());
        Ok(host)
    }

    pub fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error> {
        match &mut self.backend {
            Backend::SlurmRest(b) => b.wait_for_completion(cancel),
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.wait_for_completion(cancel),
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => b.wait_for_completion(cancel),
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.wait_for_completion(cancel),
        }
    }

    pub fn is_live(&self) -> bool {
        match &self.backend {
            Backend::SlurmRest(b) => b.is_live(),
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.is_live(),
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => b.is_live(),
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.is_live(),
        }
    }

    pub fn cancel_if_live(&mut self) -> Result<(), Error> {
        match &mut self.backend {
            Backend::SlurmRest(b) => b.cancel_if_live(),
            #[cfg(feature = "slurm-native")]
            Backend::SlurmNative(b) => b.cancel_if_live(),
            #[cfg(feature = "pbs")]
            Backend::Pbs(b) => b.cancel_if_live(),
            #[cfg(feature = "drmaa")]
            Backend::Drmaa(b) => b.cancel_if_live(),
        }
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        let _ = self.cancel_if_live();
        if let Some(host) = self.host.clone() {
            let runner = SshCommandRunner::new(host);
            let command = format!(
                "rm -fv '{}' '{}'",
                self.scratch.root_path.replace('\'', "'\\''"),
                self.scratch.job_stderr.replace('\'', "'\\''")
            );
            let _ = runner.run(&command);
        }
    }
}

/// The capability set the orchestrator drives, as a trait rather than the
/// concrete [`SchedulerHandle`] so that orchestrator-level tests can
/// substitute an in-process fake instead of talking to a real batch
/// scheduler. Production code has exactly one implementor; this is a test
/// seam, not an invitation to add further backends behind `dyn`.
pub trait Scheduler {
    fn submit(&mut self, drv_path: &str, tunables: &SubmissionTunables) -> Result<(), Error>;
    fn job_id(&self) -> Option<String>;
    fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error>;
    fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error>;
    fn is_live(&self) -> bool;
    fn cancel_if_live(&mut self) -> Result<(), Error>;
    fn scratch(&self) -> &ScratchPaths;
}

impl Scheduler for SchedulerHandle {
    fn submit(&mut self, drv_path: &str, tunables: &SubmissionTunables) -> Result<(), Error> {
        SchedulerHandle::submit(self, drv_path, tunables)
    }
    fn job_id(&self) -> Option<String> {
        SchedulerHandle::job_id(self)
    }
    fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        SchedulerHandle::wait_for_host_assignment(self, cancel)
    }
    fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error> {
        SchedulerHandle::wait_for_completion(self, cancel)
    }
    fn is_live(&self) -> bool {
        SchedulerHandle::is_live(self)
    }
    fn cancel_if_live(&mut self) -> Result<(), Error> {
        SchedulerHandle::cancel_if_live(self)
    }
    fn scratch(&self) -> &ScratchPaths {
        SchedulerHandle::scratch(self)
    }
}

/// Builds a [`Scheduler`] for one derivation. The production implementor
/// wraps [`BackendConfig`]; orchestrator tests supply a factory that
/// returns an in-process fake.
pub trait SchedulerFactory {
    type Handle: Scheduler;
    fn build(&self, drv_path: &str) -> Result<Self::Handle, Error>;
}

pub struct RealSchedulerFactory<'a> {
    pub config: BackendConfig<'a>,
}

impl<'a> SchedulerFactory for RealSchedulerFactory<'a> {
    type Handle = SchedulerHandle;
    fn build(&self, drv_path: &str) -> Result<Self::Handle, Error> {
        SchedulerHandle::new(&self.config, drv_path)
    }
}

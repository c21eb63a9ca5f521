//! Slurm's native C client library (`libslurm`), used when the cluster has
//! no `slurmrestd` deployed. Gated behind the `slurm-native` feature since
//! it links against a system library.

mod sys {
    //! Minimal safe wrappers around the handful of `libslurm` entry points
    //! this backend needs. All `unsafe` lives here, mirroring the
    //! syscall-wrapper idiom of isolating FFI behind small safe functions
    //! that return `Result`.
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int};

    #[repr(C)]
    pub struct JobDescMsg {
        pub script: *const c_char,
        pub name: *const c_char,
        pub std_err: *const c_char,
        pub min_cpus: u16,
        pub min_mem_per_node: u64,
    }

    #[repr(C)]
    pub struct SubmitResponseMsg {
        pub job_id: u32,
        pub error_code: u32,
    }

    #[repr(C)]
    pub struct JobInfo {
        pub job_id: u32,
        pub job_state: u32,
        pub batch_host: *mut c_char,
        pub exit_code: i32,
    }

    #[repr(C)]
    pub struct JobInfoMsg {
        pub record_count: u32,
        pub job_array: *mut JobInfo,
    }

    pub const JOB_PENDING: u32 = 0;
    pub const JOB_RUNNING: u32 = 1;
    pub const JOB_COMPLETE: u32 = 2;
    pub const JOB_FAILED: u32 = 3;

    extern "C" {
        fn slurm_init(conf_file: *const c_char);
        fn slurm_submit_batch_job(job_desc: *mut JobDescMsg, resp: *mut *mut SubmitResponseMsg) -> c_int;
        fn slurm_free_submit_response_response_msg(resp: *mut SubmitResponseMsg);
        fn slurm_load_job(msg: *mut *mut JobInfoMsg, job_id: u32, show_flags: u16) -> c_int;
        fn slurm_free_job_info_msg(msg: *mut JobInfoMsg);
        fn slurm_kill_job(job_id: u32, signal: u16, flags: u16) -> c_int;
        fn slurm_strerror(errnum: c_int) -> *const c_char;
    }

    pub fn init(conf_file: &str) {
        let c_conf = CString::new(conf_file).unwrap_or_default();
        let ptr = if conf_file.is_empty() {
            std::ptr::null()
        } else {
            c_conf.as_ptr()
        };
        unsafe { slurm_init(ptr) }
    }

    pub fn last_error() -> String {
        unsafe {
            let ptr = slurm_strerror(errno_value());
            if ptr.is_null() {
                "unknown slurm error".to_string()
            } else {
                std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
            }
        }
    }

    fn errno_value() -> c_int {
        // libslurm follows the same convention as libc errno for its own
        // error codes; exposed here so `last_error` can render it.
        unsafe { *libc::__errno_location() }
    }

    pub fn submit_batch_job(
        script: &str,
        name: &str,
        std_err: &str,
        cpus: u16,
        mem_per_node: u64,
    ) -> Result<u32, String> {
        let c_script = CString::new(script).map_err(|e| e.to_string())?;
        let c_name = CString::new(name).map_err(|e| e.to_string())?;
        let c_std_err = CString::new(std_err).map_err(|e| e.to_string())?;
        let mut desc = JobDescMsg {
            script: c_script.as_ptr(),
            name: c_name.as_ptr(),
            std_err: c_std_err.as_ptr(),
            min_cpus: cpus,
            min_mem_per_node: mem_per_node,
        };
        let mut resp: *mut SubmitResponseMsg = std::ptr::null_mut();
        let rc = unsafe { slurm_submit_batch_job(&mut desc, &mut resp) };
        if rc != 0 {
            return Err(last_error());
        }
        let job_id = unsafe { (*resp).job_id };
        unsafe { slurm_free_submit_response_response_msg(resp) };
        Ok(job_id)
    }

    pub struct PolledJob {
        pub job_state: u32,
        pub batch_host: Option<String>,
        pub exit_code: i32,
    }

    pub fn load_job(job_id: u32) -> Result<PolledJob, String> {
        let mut msg: *mut JobInfoMsg = std::ptr::null_mut();
        let rc = unsafe { slurm_load_job(&mut msg, job_id, 0) };
        if rc != 0 {
            return Err(last_error());
        }
        let info = unsafe { &*(*msg).job_array };
        let batch_host = if info.batch_host.is_null() {
            None
        } else {
            Some(unsafe {
                std::ffi::CStr::from_ptr(info.batch_host)
                    .to_string_lossy()
                    .into_owned()
            })
        };
        let polled = PolledJob {
            job_state: info.job_state,
            batch_host,
            exit_code: info.exit_code,
        };
        unsafe { slurm_free_job_info_msg(msg) };
        Ok(polled)
    }

    pub fn kill_job(job_id: u32) -> Result<(), String> {
        let rc = unsafe { slurm_kill_job(job_id, 9, 0) };
        if rc != 0 {
            Err(last_error())
        } else {
            Ok(())
        }
    }
}

use std::sync::atomic::AtomicBool;

use crate::backoff::{sleep_cancelable, Backoff};
use crate::scratch::ScratchPaths;
use crate::Error;

#[derive(Debug, Clone, Default)]
pub struct SlurmNativeConfig {
    pub conf_file: String,
    pub store_dir: String,
    pub remote_nix_bin_dir: String,
}

pub struct SlurmNative {
    config: SlurmNativeConfig,
    job_id: Option<u32>,
    last_state: Option<u32>,
}

impl SlurmNative {
    pub fn new(config: SlurmNativeConfig) -> Self {
        sys::init(&config.conf_file);
        Self {
            config,
            job_id: None,
            last_state: None,
        }
    }

    pub fn submit(
        &mut self,
        drv_path: &str,
        scratch: &ScratchPaths,
        cpus: Option<u32>,
        mem_per_node: Option<u64>,
    ) -> Result<(), Error> {
        let script = crate::scratch::generate_script(
            &self.config.remote_nix_bin_dir,
            &self.config.store_dir,
            drv_path,
            &scratch.root_path,
        );
        let id = sys::submit_batch_job(
            &script,
            &format!("nsh-{drv_path}"),
            &scratch.job_stderr,
            cpus.unwrap_or(0) as u16,
            mem_per_node.unwrap_or(0),
        )
        .map_err(Error::Submission)?;
        self.job_id = Some(id);
        self.last_state = Some(sys::JOB_PENDING);
        Ok(())
    }

    pub fn job_id(&self) -> Option<String> {
        self.job_id.map(|id| id.to_string())
    }

    fn poll(&mut self) -> Result<sys::PolledJob, Error> {
        let id = self.job_id.ok_or_else(|| Error::Query("no job submitted".to_string()))?;
        let polled = sys::load_job(id).map_err(Error::Query)?;
        self.last_state = Some(polled.job_state);
        Ok(polled)
    }

    pub fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        let mut backoff = Backoff::host_assignment();
        loop {
            let polled = self.poll()?;
            if let Some(host) = polled.batch_host {
                if !host.is_empty() {
                    return Ok(host);
                }
            }
            sleep_cancelable(backoff.step(), cancel)?;
        }
    }

    pub fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error> {
        let mut backoff = Backoff::completion_polling();
        loop {
            let polled = self.poll()?;
            match polled.job_state {
                sys::JOB_COMPLETE | sys::JOB_FAILED => return Ok(polled.exit_code),
                sys::JOB_PENDING | sys::JOB_RUNNING => sleep_cancelable(backoff.step(), cancel)?,
                _ => return Ok(-1),
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(self.last_state, Some(sys::JOB_PENDING) | Some(sys::JOB_RUNNING))
    }

    pub fn cancel_if_live(&mut self) -> Result<(), Error> {
        if !self.is_live() {
            return Ok(());
        }
        if let Some(id) = self.job_id {
            sys::kill_job(id).map_err(Error::Cancel)?;
        }
        Ok(())
    }
}

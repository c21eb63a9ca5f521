//! Generic grid engines via DRMAA (`libdrmaa`). Gated behind the `drmaa`
//! feature since it links against a system library.

mod sys {
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int, c_long};

    pub const DRMAA_ERROR_STRING_BUFFER: usize = 1024;
    pub const DRMAA_JOBNAME_BUFFER: usize = 1024;

    pub const DRMAA_PS_UNDETERMINED: c_int = 0x00;
    pub const DRMAA_PS_QUEUED_ACTIVE: c_int = 0x10;
    pub const DRMAA_PS_SYSTEM_ON_HOLD: c_int = 0x11;
    pub const DRMAA_PS_USER_ON_HOLD: c_int = 0x12;
    pub const DRMAA_PS_USER_SYSTEM_ON_HOLD: c_int = 0x13;
    pub const DRMAA_PS_RUNNING: c_int = 0x20;
    pub const DRMAA_PS_DONE: c_int = 0x40;
    pub const DRMAA_PS_FAILED: c_int = 0x41;

    pub const DRMAA_CONTROL_TERMINATE: c_int = 0;

    #[repr(C)]
    pub struct JobTemplate {
        _private: [u8; 0],
    }

    extern "C" {
        fn drmaa_init(contact: *const c_char, error: *mut c_char, error_len: c_int) -> c_int;
        fn drmaa_exit(error: *mut c_char, error_len: c_int) -> c_int;
        fn drmaa_allocate_job_template(
            jt: *mut *mut JobTemplate,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_delete_job_template(jt: *mut JobTemplate, error: *mut c_char, error_len: c_int) -> c_int;
        fn drmaa_set_attribute(
            jt: *mut JobTemplate,
            name: *const c_char,
            value: *const c_char,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_run_job(
            job_id_out: *mut c_char,
            job_id_len: c_int,
            jt: *mut JobTemplate,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_job_ps(
            job_id: *const c_char,
            remote_ps: *mut c_int,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_wait(
            job_id: *const c_char,
            job_id_out: *mut c_char,
            job_id_out_len: c_int,
            stat: *mut c_int,
            timeout: c_long,
            rusage: *mut *mut std::ffi::c_void,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_wifexited(exited: *mut c_int, stat: c_int, error: *mut c_char, error_len: c_int) -> c_int;
        fn drmaa_wexitstatus(
            exit_status: *mut c_int,
            stat: c_int,
            error: *mut c_char,
            error_len: c_int,
        ) -> c_int;
        fn drmaa_control(job_id: *const c_char, action: c_int, error: *mut c_char, error_len: c_int) -> c_int;
    }

    fn err_buf() -> Vec<c_char> {
        vec![0; DRMAA_ERROR_STRING_BUFFER]
    }

    fn buf_to_string(buf: &[c_char]) -> String {
        let bytes: Vec<u8> = buf.iter().take_while(|&&c| c != 0).map(|&c| c as u8).collect();
        String::from_utf8_lossy(&bytes).into_owned()
    }

    pub fn init() -> Result<(), String> {
        let mut err = err_buf();
        let rc = unsafe { drmaa_init(std::ptr::null(), err.as_mut_ptr(), err.len() as c_int) };
        if rc != 0 {
            return Err(buf_to_string(&err));
        }
        Ok(())
    }

    pub struct Session;

    impl Drop for Session {
        fn drop(&mut self) {
            let mut err = err_buf();
            unsafe {
                drmaa_exit(err.as_mut_ptr(), err.len() as c_int);
            }
        }
    }

    pub fn run_job(script_path: &str, job_name: &str, std_err_path: &str) -> Result<String, String> {
        let mut err = err_buf();
        let mut jt: *mut JobTemplate = std::ptr::null_mut();
        let rc = unsafe { drmaa_allocate_job_template(&mut jt, err.as_mut_ptr(), err.len() as c_int) };
        if rc != 0 {
            return Err(buf_to_string(&err));
        }

        let set = |name: &str, value: &str| -> Result<(), String> {
            let c_name = CString::new(name).map_err(|e| e.to_string())?;
            let c_value = CString::new(value).map_err(|e| e.to_string())?;
            let mut err = err_buf();
            let rc = unsafe {
                drmaa_set_attribute(jt, c_name.as_ptr(), c_value.as_ptr(), err.as_mut_ptr(), err.len() as c_int)
            };
            if rc != 0 {
                Err(buf_to_string(&err))
            } else {
                Ok(())
            }
        };
        set("drmaa_remote_command", script_path)?;
        set("drmaa_job_name", job_name)?;
        set("drmaa_error_path", &format!(":{std_err_path}"))?;

        let mut job_id_buf = vec![0 as c_char; DRMAA_JOBNAME_BUFFER];
        let mut err = err_buf();
        let rc = unsafe {
            drmaa_run_job(
                job_id_buf.as_mut_ptr(),
                job_id_buf.len() as c_int,
                jt,
                err.as_mut_ptr(),
                err.len() as c_int,
            )
        };
        let mut delete_err = err_buf();
        unsafe {
            drmaa_delete_job_template(jt, delete_err.as_mut_ptr(), delete_err.len() as c_int);
        }
        if rc != 0 {
            return Err(buf_to_string(&err));
        }
        Ok(buf_to_string(&job_id_buf))
    }

    pub fn job_ps(job_id: &str) -> Result<c_int, String> {
        let c_id = CString::new(job_id).map_err(|e| e.to_string())?;
        let mut state: c_int = DRMAA_PS_UNDETERMINED;
        let mut err = err_buf();
        let rc = unsafe { drmaa_job_ps(c_id.as_ptr(), &mut state, err.as_mut_ptr(), err.len() as c_int) };
        if rc != 0 {
            return Err(buf_to_string(&err));
        }
        Ok(state)
    }

    pub fn wait_no_block(job_id: &str) -> Result<Option<i32>, String> {
        let c_id = CString::new(job_id).map_err(|e| e.to_string())?;
        let mut out_id = vec![0 as c_char; DRMAA_JOBNAME_BUFFER];
        let mut stat: c_int = 0;
        let mut err = err_buf();
        let rc = unsafe {
            drmaa_wait(
                c_id.as_ptr(),
                out_id.as_mut_ptr(),
                out_id.len() as c_int,
                &mut stat,
                0,
                std::ptr::null_mut(),
                err.as_mut_ptr(),
                err.len() as c_int,
            )
        };
        if rc != 0 {
            // A nonzero return with "would block" semantics means the job
            // hasn't finished yet; the caller should keep polling rather
            // than loop here silently.
            return Ok(None);
        }
        let mut exited: c_int = 0;
        let mut wifexited_err = err_buf();
        unsafe {
            drmaa_wifexited(&mut exited, stat, wifexited_err.as_mut_ptr(), wifexited_err.len() as c_int);
        }
        if exited == 0 {
            return Ok(Some(-1));
        }
        let mut exit_status: c_int = 0;
        let mut wexit_err = err_buf();
        unsafe {
            drmaa_wexitstatus(&mut exit_status, stat, wexit_err.as_mut_ptr(), wexit_err.len() as c_int);
        }
        Ok(Some(exit_status))
    }

    pub fn terminate(job_id: &str) -> Result<(), String> {
        let c_id = CString::new(job_id).map_err(|e| e.to_string())?;
        let mut err = err_buf();
        let rc = unsafe {
            drmaa_control(c_id.as_ptr(), DRMAA_CONTROL_TERMINATE, err.as_mut_ptr(), err.len() as c_int)
        };
        if rc != 0 {
            Err(buf_to_string(&err))
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
pub struct DrmaaConfig {
    pub store_dir: String,
    pub remote_nix_bin_dir: String,
}

pub struct Drmaa {
    config: DrmaaConfig,
    _session: sys::Session,
    job_id: Option<String>,
    last_state: Option<i32>,
    exit_code: Option<i32>,
}

impl Drmaa {
    pub fn new(config: DrmaaConfig) -> Result<Self, Error> {
        sys::init().map_err(Error::Native)?;
        Ok(Self {
            config,
            _session: sys::Session,
            job_id: None,
            last_state: None,
            exit_code: None,
        })
    }

    pub fn submit(&mut self, drv_path: &str, scratch: &ScratchPaths) -> Result<(), Error> {
        let script = crate::scratch::generate_script(
            &self.config.remote_nix_bin_dir,
            &self.config.store_dir,
            drv_path,
            &scratch.root_path,
        );
        let script_path = format!("{}.script", scratch.root_path);
        std::fs::write(&script_path, script).map_err(|e| Error::Submission(e.to_string()))?;
        let id = sys::run_job(&script_path, &format!("nsh-{drv_path}"), &scratch.job_stderr)
            .map_err(Error::Submission)?;
        self.job_id = Some(id);
        self.last_state = Some(sys::DRMAA_PS_QUEUED_ACTIVE);
        Ok(())
    }

    pub fn job_id(&self) -> Option<String> {
        self.job_id.clone()
    }

    pub fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        // DRMAA does not expose the assigned execution host until the job
        // starts running; approximate "assigned" with "running" and return
        // a placeholder the caller resolves via `drmaa_wifexited`/accounting
        // if it needs the concrete hostname.
        let mut backoff = Backoff::host_assignment();
        let id = self.job_id.clone().ok_or_else(|| Error::Query("no job submitted".to_string()))?;
        loop {
            let state = sys::job_ps(&id).map_err(Error::Query)?;
            self.last_state = Some(state);
            if state == sys::DRMAA_PS_RUNNING {
                return Ok("localhost".to_string());
            }
            sleep_cancelable(backoff.step(), cancel)?;
        }
    }

    pub fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error> {
        let mut backoff = Backoff::completion_polling();
        let id = self.job_id.clone().ok_or_else(|| Error::Query("no job submitted".to_string()))?;
        loop {
            match sys::wait_no_block(&id).map_err(Error::Query)? {
                Some(code) => {
                    self.last_state = Some(sys::DRMAA_PS_DONE);
                    self.exit_code = Some(code);
                    return Ok(code);
                }
                None => sleep_cancelable(backoff.step(), cancel)?,
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.last_state,
            Some(sys::DRMAA_PS_QUEUED_ACTIVE)
                | Some(sys::DRMAA_PS_SYSTEM_ON_HOLD)
                | Some(sys::DRMAA_PS_USER_ON_HOLD)
                | Some(sys::DRMAA_PS_USER_SYSTEM_ON_HOLD)
                | Some(sys::DRMAA_PS_RUNNING)
        )
    }

    pub fn cancel_if_live(&mut self) -> Result<(), Error> {
        if !self.is_live() {
            return Ok(());
        }
        if let Some(id) = self.job_id.clone() {
            sys::terminate(&id).map_err(Error::Cancel)?;
        }
        Ok(())
    }
}

//! PBS/OpenPBS, via its IFL (`libpbs`) client API. Gated behind the `pbs`
//! feature since it links against a system library.

mod sys {
    use std::ffi::CString;
    use std::os::raw::{c_char, c_int};

    #[repr(C)]
    pub struct Attropl {
        pub next: *mut Attropl,
        pub name: *const c_char,
        pub resource: *const c_char,
        pub value: *const c_char,
        pub op: c_int,
    }

    #[repr(C)]
    pub struct Attrl {
        pub next: *mut Attrl,
        pub name: *const c_char,
        pub resource: *const c_char,
        pub value: *mut c_char,
    }

    #[repr(C)]
    pub struct BatchStatus {
        pub next: *mut BatchStatus,
        pub name: *mut c_char,
        pub attribs: *mut Attrl,
    }

    pub const ATTR_EXIT_STATUS: &str = "exit_status";
    pub const ATTR_STATE: &str = "job_state";
    pub const ATTR_EXEC_HOST: &str = "exec_host";

    extern "C" {
        fn pbs_connect(server: *const c_char) -> c_int;
        fn pbs_disconnect(connect: c_int) -> c_int;
        fn pbs_submit(
            connect: c_int,
            attrib: *mut Attropl,
            script: *const c_char,
            destination: *const c_char,
            extend: *const c_char,
        ) -> *mut c_char;
        fn pbs_statjob(
            connect: c_int,
            id: *const c_char,
            attrib: *mut Attrl,
            extend: *const c_char,
        ) -> *mut BatchStatus;
        fn pbs_statfree(status: *mut BatchStatus);
        fn pbs_deljob(connect: c_int, id: *const c_char, extend: *const c_char) -> c_int;
        fn pbs_geterrmsg(connect: c_int) -> *const c_char;
    }

    pub struct Connection(c_int);

    impl Connection {
        pub fn open(server: &str) -> Result<Self, String> {
            let c_server = CString::new(server).map_err(|e| e.to_string())?;
            let fd = unsafe { pbs_connect(c_server.as_ptr()) };
            if fd < 0 {
                return Err(format!("pbs_connect failed for {server}"));
            }
            Ok(Connection(fd))
        }

        fn last_error(&self) -> String {
            unsafe {
                let ptr = pbs_geterrmsg(self.0);
                if ptr.is_null() {
                    "unknown pbs error".to_string()
                } else {
                    std::ffi::CStr::from_ptr(ptr).to_string_lossy().into_owned()
                }
            }
        }

        pub fn submit(&self, script_path: &str, resources: &[(String, String)]) -> Result<String, String> {
            let c_script = CString::new(script_path).map_err(|e| e.to_string())?;
            let resource_cstrs: Vec<(CString, CString, CString)> = resources
                .iter()
                .map(|(k, v)| {
                    (
                        CString::new("Resource_List").unwrap(),
                        CString::new(k.as_str()).unwrap(),
                        CString::new(v.as_str()).unwrap(),
                    )
                })
                .collect();
            let mut nodes: Vec<Attropl> = resource_cstrs
                .iter()
                .map(|(name, resource, value)| Attropl {
                    next: std::ptr::null_mut(),
                    name: name.as_ptr(),
                    resource: resource.as_ptr(),
                    value: value.as_ptr(),
                    op: 1,
                })
                .collect();
            for i in 0..nodes.len().saturating_sub(1) {
                let next_ptr: *mut Attropl = &mut nodes[i + 1];
                nodes[i].next = next_ptr;
            }
            let head = nodes.first_mut().map(|a| a as *mut Attropl).unwrap_or(std::ptr::null_mut());
            let id_ptr = unsafe {
                pbs_submit(
                    self.0,
                    head,
                    c_script.as_ptr(),
                    std::ptr::null(),
                    std::ptr::null(),
                )
            };
            if id_ptr.is_null() {
                return Err(self.last_error());
            }
            let id = unsafe { std::ffi::CStr::from_ptr(id_ptr).to_string_lossy().into_owned() };
            Ok(id)
        }

        pub fn stat(&self, job_id: &str) -> Result<Vec<(String, String)>, String> {
            let c_id = CString::new(job_id).map_err(|e| e.to_string())?;
            let status = unsafe { pbs_statjob(self.0, c_id.as_ptr(), std::ptr::null_mut(), std::ptr::null()) };
            if status.is_null() {
                return Err(self.last_error());
            }
            let mut out = Vec::new();
            unsafe {
                let mut attr = (*status).attribs;
                while !attr.is_null() {
                    let name = std::ffi::CStr::from_ptr((*attr).name).to_string_lossy().into_owned();
                    let value = if (*attr).value.is_null() {
                        String::new()
                    } else {
                        std::ffi::CStr::from_ptr((*attr).value).to_string_lossy().into_owned()
                    };
                    out.push((name, value));
                    attr = (*attr).next;
                }
                pbs_statfree(status);
            }
            Ok(out)
        }

        pub fn delete_job(&self, job_id: &str) -> Result<(), String> {
            let c_id = CString::new(job_id).map_err(|e| e.to_string())?;
            let rc = unsafe { pbs_deljob(self.0, c_id.as_ptr(), std::ptr::null()) };
            if rc != 0 {
                Err(self.last_error())
            } else {
                Ok(())
            }
        }
    }

    impl Drop for Connection {
        fn drop(&mut self) {
            unsafe {
                pbs_disconnect(self.0);
            }
        }
    }
}

use std::sync::atomic::AtomicBool;

use crate::backoff::{sleep_cancelable, Backoff};
use crate::scratch::ScratchPaths;
use crate::Error;

#[derive(Debug, Clone, Default)]
pub struct PbsConfig {
    pub host: String,
    pub store_dir: String,
    pub remote_nix_bin_dir: String,
}

pub struct Pbs {
    config: PbsConfig,
    conn: sys::Connection,
    job_id: Option<String>,
    last_state: Option<String>,
    script_path: Option<String>,
}

impl Pbs {
    pub fn new(config: PbsConfig) -> Result<Self, Error> {
        let conn = sys::Connection::open(&config.host).map_err(Error::Submission)?;
        Ok(Self {
            config,
            conn,
            job_id: None,
            last_state: None,
            script_path: None,
        })
    }

    pub fn submit(
        &mut self,
        drv_path: &str,
        scratch: &ScratchPaths,
        resources: &[(String, String)],
    ) -> Result<(), Error> {
        let script = crate::scratch::generate_script(
            &self.config.remote_nix_bin_dir,
            &self.config.store_dir,
            drv_path,
            &scratch.root_path,
        );
        let script_path = format!("{}.script", scratch.root_path);
        std::fs::write(&script_path, script).map_err(|e| Error::Submission(e.to_string()))?;
        let mut all_resources = resources.to_vec();
        all_resources.push(("Output_Path".to_string(), scratch.job_stderr.clone()));
        let id = self
            .conn
            .submit(&script_path, &all_resources)
            .map_err(Error::Submission)?;
        self.job_id = Some(id);
        self.last_state = Some("Q".to_string());
        self.script_path = Some(script_path);
        Ok(())
    }

    pub fn job_id(&self) -> Option<String> {
        self.job_id.clone()
    }

    fn poll(&mut self) -> Result<Vec<(String, String)>, Error> {
        let id = self
            .job_id
            .clone()
            .ok_or_else(|| Error::Query("no job submitted".to_string()))?;
        let attrs = self.conn.stat(&id).map_err(Error::Query)?;
        if let Some((_, v)) = attrs.iter().find(|(k, _)| k == sys::ATTR_STATE) {
            self.last_state = Some(v.clone());
        }
        Ok(attrs)
    }

    pub fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        let mut backoff = Backoff::host_assignment();
        loop {
            let attrs = self.poll()?;
            if let Some((_, host)) = attrs.iter().find(|(k, _)| k == sys::ATTR_EXEC_HOST) {
                if !host.is_empty() {
                    let node = host.split('/').next().unwrap_or(host).to_string();
                    return Ok(node);
                }
            }
            sleep_cancelable(backoff.step(), cancel)?;
        }
    }

    pub fn wait_for_completion(&mut self, cancel: &AtomicBool) -> Result<i32, Error> {
        let mut backoff = Backoff::completion_polling();
        loop {
            let attrs = self.poll()?;
            let state = self.last_state.clone().unwrap_or_default();
            if state == "F" {
                let exit_status = attrs
                    .iter()
                    .find(|(k, _)| k == sys::ATTR_EXIT_STATUS)
                    .and_then(|(_, v)| v.parse::<i32>().ok());
                return Ok(exit_status.unwrap_or(-1));
            }
            sleep_cancelable(backoff.step(), cancel)?;
        }
    }

    pub fn is_live(&self) -> bool {
        !matches!(self.last_state.as_deref(), Some("F") | None)
    }

    pub fn cancel_if_live(&mut self) -> Result<(), Error> {
        if !self.is_live() {
            return Ok(());
        }
        if let Some(id) = self.job_id.clone() {
            self.conn.delete_job(&id).map_err(Error::Cancel)?;
        }
        Ok(())
    }
}

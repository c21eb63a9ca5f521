//! Slurm's REST API (`slurmrestd`), matching the endpoints and JSON shapes
//! the original C++ implementation spoke to directly.

use std::sync::atomic::AtomicBool;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::backoff::{sleep_cancelable, Backoff};
use crate::scratch::ScratchPaths;
use crate::Error;

const API_VERSION: &str = "v0.0.43";

#[derive(Debug, Clone)]
pub struct SlurmRestConfig {
    pub host: String,
    pub port: u16,
    pub token: String,
    pub store_dir: String,
    pub remote_nix_bin_dir: String,
}

pub struct SlurmRest {
    config: SlurmRestConfig,
    client: reqwest::blocking::Client,
    job_id: Option<u64>,
    last_state: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SubmitResponse {
    #[serde(default)]
    job_id: Option<u64>,
    #[serde(default)]
    errors: Vec<SlurmErrorEntry>,
}

#[derive(Debug, Deserialize)]
struct SlurmErrorEntry {
    #[serde(default)]
    error: String,
}

#[derive(Debug, Deserialize)]
struct JobsResponse {
    #[serde(default)]
    jobs: Vec<JobInfo>,
}

#[derive(Debug, Deserialize)]
struct JobInfo {
    #[serde(default)]
    batch_host: Option<String>,
    #[serde(default)]
    job_state: Vec<String>,
    #[serde(default)]
    exit_code: Option<ExitCodeField>,
}

#[derive(Debug, Deserialize)]
struct ExitCodeField {
    return_code: ReturnCode,
}

#[derive(Debug, Deserialize)]
struct ReturnCode {
    set: bool,
    number: i32,
}

#[derive(Debug, Serialize)]
struct SubmitJobWrapper<'a> {
    job: Value,
    script: &'a str,
}

impl SlurmRest {
    pub fn new(config: SlurmRestConfig) -> Self {
        Self {
            config,
            client: reqwest::blocking::Client::new(),
            job_id: None,
            last_state: None,
        }
    }

    fn base_url(&self) -> String {
        format!(
            "http://{}:{}/slurm/{API_VERSION}",
            self.config.host, self.config.port
        )
    }

    fn auth(&self, req: reqwest::blocking::RequestBuilder) -> reqwest::blocking::RequestBuilder {
        if self.config.token.is_empty() {
            req
        } else {
            req.header("X-SLURM-USER-TOKEN", &self.config.token)
        }
    }

    pub fn submit(
        &mut self,
        drv_path: &str,
        scratch: &ScratchPaths,
        extra_params: &Value,
    ) -> Result<(), Error> {
        let script = crate::scratch::generate_script(
            &self.config.remote_nix_bin_dir,
            &self.config.store_dir,
            drv_path,
            &scratch.root_path,
        );
        let mut job = json!({
            "standard_error": scratch.job_stderr,
            "name": format!("nsh-{drv_path}"),
        });
        if let Value::Object(extra) = extra_params {
            if let Value::Object(job_obj) = &mut job {
                for (k, v) in extra {
                    job_obj.insert(k.clone(), v.clone());
                }
            }
        }
        let body = SubmitJobWrapper { job, script: &script };

        let resp = self
            .auth(self.client.post(format!("{}/job/submit", self.base_url())))
            .json(&body)
            .send()
            .map_err(|e| Error::Submission(e.to_string()))?;

        let status = resp.status();
        let text = resp.text().unwrap_or_default();
        if status.as_u16() == 401 || text.contains("Authentication failure") {
            return Err(Error::AuthenticationFailure);
        }
        if !status.is_success() {
            return Err(Error::Submission(text));
        }
        let parsed: SubmitResponse =
            serde_json::from_str(&text).map_err(|e| Error::Submission(e.to_string()))?;
        if !parsed.errors.is_empty() {
            return Err(Error::Submission(
                parsed
                    .errors
                    .into_iter()
                    .map(|e| e.error)
                    .collect::<Vec<_>>()
                    .join("; "),
            ));
        }
        self.job_id = Some(parsed.job_id.ok_or_else(|| {
            Error::Submission("submit response carried no job_id".to_string())
        })?);
        self.last_state = Some("PENDING".to_string());
        Ok(())
    }

    pub fn job_id(&self) -> Option<String> {
        self.job_id.map(|id| id.to_string())
    }

    fn fetch(&mut self) -> Result<JobInfo, Error> {
        let id = self.job_id.ok_or_else(|| Error::Query("no job submitted".to_string()))?;
        let resp = self
            .auth(self.client.get(format!("{}/job/{id}", self.base_url())))
            .send()
            .map_err(|e| Error::Query(e.to_string()))?;
        let parsed: JobsResponse = resp.json().map_err(|e| Error::Query(e.to_string()))?;
        parsed
            .jobs
            .into_iter()
            .next()
            .ok_or_else(|| Error::Query("job not found".to_string()))
    }

    pub fn wait_for_host_assignment(&mut self, cancel: &AtomicBool) -> Result<String, Error> {
        let mut backoff = Backoff::host_assignment();
        loop {
            let info = self.fetch()?;
            if let Some(state) = info.job_state.first() {
                self.last_state = Some(state.clone());
            }
            if let Some(host) = info.batch_host {
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
            let info = self.fetch()?;
            let state = info.job_state.first().cloned().unwrap_or_default();
            self.last_state = Some(state.clone());
            match state.as_str() {
                "COMPLETED" | "FAILED" => {
                    return Ok(info
                        .exit_code
                        .filter(|e| e.return_code.set)
                        .map(|e| e.return_code.number)
                        .unwrap_or(-1));
                }
                "CANCELLED" | "PREEMPTED" | "TIMEOUT" | "NODE_FAIL" | "OUT_OF_MEMORY" => {
                    return Ok(-1);
                }
                _ => sleep_cancelable(backoff.step(), cancel)?,
            }
        }
    }

    pub fn is_live(&self) -> bool {
        matches!(
            self.last_state.as_deref(),
            Some("PENDING") | Some("RUNNING")
        )
    }

    pub fn cancel_if_live(&mut self) -> Result<(), Error> {
        if !self.is_live() {
            return Ok(());
        }
        let Some(id) = self.job_id else { return Ok(()) };
        self.auth(self.client.delete(format!("{}/job/{id}", self.base_url())))
            .send()
            .map_err(|e| Error::Cancel(e.to_string()))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn is_live_only_for_pending_or_running() {
        let mut s = SlurmRest::new(SlurmRestConfig {
            host: "localhost".into(),
            port: 6820,
            token: String::new(),
            store_dir: "/nix/store".into(),
            remote_nix_bin_dir: String::new(),
        });
        assert!(!s.is_live());
        s.last_state = Some("RUNNING".to_string());
        assert!(s.is_live());
        s.last_state = Some("COMPLETED".to_string());
        assert!(!s.is_live());
    }
}

//! Settings for the remote build hook, loaded from the same flattened
//! `key = value` config grammar the rest of the Nix tool family uses.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::Deserialize;
use strum::{Display, EnumString};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown job-scheduler {0:?}")]
    UnknownScheduler(String),
    #[error("invalid value for {key}: {value:?}")]
    InvalidValue { key: &'static str, value: String },
    #[error("reading config file {path:?}")]
    ReadFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing {key} as JSON")]
    Json {
        key: &'static str,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Display, EnumString)]
#[strum(serialize_all = "kebab-case")]
pub enum JobScheduler {
    #[default]
    Slurm,
    SlurmNative,
    Pbs,
    Grid,
}

/// Flattened settings consumed by the orchestrator. Every field has a
/// built-in default; see `Settings::load` for the precedence of overriding
/// sources.
#[derive(Clone, Debug)]
pub struct Settings {
    pub job_scheduler: JobScheduler,
    pub system: String,
    pub system_features: Vec<String>,
    pub store_dir: String,
    pub remote_store: String,
    pub state_dir: PathBuf,
    pub slurm_api_host: String,
    pub slurm_api_port: u16,
    pub slurm_jwt_token: String,
    pub slurm_extra_submission_params: serde_json::Value,
    pub slurm_conf: String,
    pub pbs_host: String,
    pub pbs_port: u16,
    pub remote_nix_bin_dir: String,
    pub max_log_size: u64,
    pub builders_use_substitutes: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            job_scheduler: JobScheduler::default(),
            system: "x86_64-linux".to_string(),
            system_features: vec!["nsh".to_string()],
            store_dir: "/nix/store".to_string(),
            remote_store: "auto".to_string(),
            state_dir: PathBuf::new(),
            slurm_api_host: "localhost".to_string(),
            slurm_api_port: 6820,
            slurm_jwt_token: String::new(),
            slurm_extra_submission_params: serde_json::Value::Null,
            slurm_conf: String::new(),
            pbs_host: String::new(),
            pbs_port: 0,
            remote_nix_bin_dir: String::new(),
            max_log_size: 0,
            builders_use_substitutes: false,
        }
    }
}

impl Settings {
    /// Loads settings following the precedence described in SPEC_FULL.md
    /// §10.3: built-in defaults, then `$NIX_CONF_DIR/nsh.conf`, then each
    /// user config file (from `NSH_USER_CONF_FILES` or the `xdg` search
    /// path, most-general-first), then the literal text of `$NSH_CONFIG`.
    pub fn load() -> Result<Self, Error> {
        let mut settings = Settings::default();

        let nix_conf_dir =
            env::var("NIX_CONF_DIR").unwrap_or_else(|_| "/etc/nix".to_string());
        apply_file_if_present(&mut settings, Path::new(&nix_conf_dir).join("nsh.conf"))?;

        for path in user_config_files() {
            apply_file_if_present(&mut settings, path)?;
        }

        if let Ok(inline) = env::var("NSH_CONFIG") {
            apply_text(&mut settings, &inline)?;
        }

        Ok(settings)
    }
}

fn user_config_files() -> Vec<PathBuf> {
    if let Ok(list) = env::var("NSH_USER_CONF_FILES") {
        return list.split(':').filter(|s| !s.is_empty()).map(PathBuf::from).collect();
    }
    let mut dirs: Vec<PathBuf> = Vec::new();
    if let Ok(xdg_dirs) = xdg::BaseDirectories::with_prefix("nix") {
        dirs.extend(xdg_dirs.get_config_dirs());
        dirs.push(xdg_dirs.get_config_home());
    }
    // xdg reports most-specific first; the settings loader wants
    // most-general-first so later entries win.
    dirs.reverse();
    dirs.into_iter().map(|d| d.join("nsh.conf")).collect()
}

fn apply_file_if_present(settings: &mut Settings, path: impl AsRef<Path>) -> Result<(), Error> {
    let path = path.as_ref();
    match fs::read_to_string(path) {
        Ok(text) => apply_text(settings, &text),
        Err(source) if source.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(source) => Err(Error::ReadFile {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn apply_text(settings: &mut Settings, text: &str) -> Result<(), Error> {
    for (key, value) in parse_lines(text) {
        apply_one(settings, &key, &value)?;
    }
    Ok(())
}

/// Parses the flat `key = value` grammar: one assignment per line, `#`
/// comments, blank lines ignored.
fn parse_lines(text: &str) -> Vec<(String, String)> {
    let mut out = Vec::new();
    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            out.push((key.trim().to_string(), value.trim().to_string()));
        }
    }
    out
}

fn apply_one(settings: &mut Settings, key: &str, value: &str) -> Result<(), Error> {
    match key {
        "job-scheduler" => {
            settings.job_scheduler = JobScheduler::from_str(value)
                .map_err(|_| Error::UnknownScheduler(value.to_string()))?;
        }
        "system" => settings.system = value.to_string(),
        "system-features" => settings.system_features = split_ws(value),
        "store-dir" => settings.store_dir = value.to_string(),
        "remote-store" => settings.remote_store = value.to_string(),
        "state-dir" => settings.state_dir = PathBuf::from(value),
        "slurm-api-host" => settings.slurm_api_host = value.to_string(),
        "slurm-api-port" => settings.slurm_api_port = parse_num(key, value)?,
        "slurm-jwt-token" => settings.slurm_jwt_token = value.to_string(),
        "slurm-extra-submission-params" => {
            settings.slurm_extra_submission_params = parse_json(key, value)?;
        }
        "slurm-conf" => settings.slurm_conf = value.to_string(),
        "pbs-host" => settings.pbs_host = value.to_string(),
        "pbs-port" => settings.pbs_port = parse_num(key, value)?,
        "remote-nix-bin-dir" => settings.remote_nix_bin_dir = value.to_string(),
        "max-log-size" => settings.max_log_size = parse_num(key, value)?,
        "builders-use-substitutes" => settings.builders_use_substitutes = parse_bool(key, value)?,
        _ => {
            // Unknown keys are ignored; this file format is shared with
            // other tools in the same family and carries keys nsh doesn't
            // recognize.
        }
    }
    Ok(())
}

fn split_ws(value: &str) -> Vec<String> {
    value.split_whitespace().map(|s| s.to_string()).collect()
}

fn parse_num<T>(key: &'static str, value: &str) -> Result<T, Error>
where
    T: FromStr,
{
    value.parse().map_err(|_| Error::InvalidValue {
        key,
        value: value.to_string(),
    })
}

fn parse_bool(key: &'static str, value: &str) -> Result<bool, Error> {
    match value {
        "true" | "1" | "yes" => Ok(true),
        "false" | "0" | "no" => Ok(false),
        _ => Err(Error::InvalidValue {
            key,
            value: value.to_string(),
        }),
    }
}

fn parse_json(key: &'static str, value: &str) -> Result<serde_json::Value, Error> {
    if value.is_empty() {
        return Ok(serde_json::Value::Null);
    }
    serde_json::from_str(value).map_err(|source| Error::Json { key, source })
}

#[derive(Debug, Default, Deserialize)]
pub struct SlurmNativeConstraints {
    pub cpus: Option<u32>,
    #[serde(rename = "memPerNode")]
    pub mem_per_node: Option<u64>,
    #[serde(rename = "memPerCPU")]
    pub mem_per_cpu: Option<u64>,
}

/// Parses the derivation-environment overrides described in SPEC_FULL.md
/// §4.2 ("Submission-time tunables"). `env` is the derivation's raw
/// environment map; absent keys yield `None`/empty fields.
pub fn parse_submission_overrides(
    env: &BTreeMap<String, String>,
) -> Result<SubmissionTunables, Error> {
    let extra_slurm_params = env
        .get("extraSlurmParams")
        .map(|v| parse_json("extraSlurmParams", v))
        .transpose()?
        .and_then(|v| v.as_object().cloned())
        .map(|m| m.into_iter().collect())
        .unwrap_or_default();

    let pbs_resources = env
        .get("pbsResources")
        .map(|v| parse_json("pbsResources", v))
        .transpose()?
        .and_then(|v| v.as_object().cloned())
        .map(|m| {
            m.into_iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k, s.to_string())))
                .collect()
        })
        .unwrap_or_default();

    let slurm_native_constraints = env
        .get("slurmNativeConstraints")
        .map(|v| serde_json::from_str::<SlurmNativeConstraints>(v))
        .transpose()
        .map_err(|source| Error::Json {
            key: "slurmNativeConstraints",
            source,
        })?
        .unwrap_or_default();

    Ok(SubmissionTunables {
        extra_slurm_params,
        pbs_resources,
        slurm_native_constraints,
    })
}

#[derive(Debug, Default)]
pub struct SubmissionTunables {
    pub extra_slurm_params: BTreeMap<String, serde_json::Value>,
    pub pbs_resources: BTreeMap<String, String>,
    pub slurm_native_constraints: SlurmNativeConstraints,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let s = Settings::default();
        assert_eq!(s.job_scheduler, JobScheduler::Slurm);
        assert_eq!(s.system, "x86_64-linux");
        assert_eq!(s.max_log_size, 0);
    }

    #[test]
    fn parses_flat_grammar_with_comments_and_blanks() {
        let mut s = Settings::default();
        apply_text(
            &mut s,
            "# a comment\n\njob-scheduler = pbs\nsystem = aarch64-linux\nmax-log-size = 1024\n",
        )
        .unwrap();
        assert_eq!(s.job_scheduler, JobScheduler::Pbs);
        assert_eq!(s.system, "aarch64-linux");
        assert_eq!(s.max_log_size, 1024);
    }

    #[test]
    fn later_file_overrides_earlier() {
        let mut s = Settings::default();
        apply_text(&mut s, "system = a\n").unwrap();
        apply_text(&mut s, "system = b\n").unwrap();
        assert_eq!(s.system, "b");
    }

    #[test]
    fn unknown_scheduler_is_an_error() {
        let mut s = Settings::default();
        let err = apply_text(&mut s, "job-scheduler = bogus\n").unwrap_err();
        assert!(matches!(err, Error::UnknownScheduler(_)));
    }

    #[test]
    fn submission_overrides_parse_nested_json() {
        let mut env = BTreeMap::new();
        env.insert(
            "slurmNativeConstraints".to_string(),
            r#"{"cpus":4,"memPerNode":8192}"#.to_string(),
        );
        let tunables = parse_submission_overrides(&env).unwrap();
        assert_eq!(tunables.slurm_native_constraints.cpus, Some(4));
        assert_eq!(tunables.slurm_native_constraints.mem_per_node, Some(8192));
    }
}

//! Package store operations the orchestrator needs. The real store lives
//! outside this process (it is the daemon's own `libstore`); this crate
//! only needs a handful of operations on it, so it talks to it the way an
//! external collaborator would: by invoking the `nix-store`/`nix` command
//! line tools the daemon itself ships.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Command;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("{path:?} is not a valid store path")]
    InvalidStorePath { path: String },
    #[error("running {command}")]
    CommandFailed {
        command: String,
        stderr: String,
    },
    #[error("spawning {command}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing derivation output")]
    Parse,
}

#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct StorePath(pub String);

impl StorePath {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// The identifier for a content-addressed derivation's single output, used
/// to look up or register a [`Realisation`].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct DrvOutput {
    pub drv_hash: String,
    pub output_name: String,
}

impl DrvOutput {
    pub fn id(&self) -> String {
        format!("{}!{}", self.drv_hash, self.output_name)
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Realisation {
    pub out_path: StorePath,
}

#[derive(Clone, Debug, Default)]
pub struct Derivation {
    pub env: BTreeMap<String, String>,
    /// Output name -> store path, when known statically (input-addressed).
    /// For content-addressed outputs this may be absent even though the
    /// output name is known.
    pub outputs: BTreeMap<String, Option<StorePath>>,
    pub content_addressed: bool,
    pub drv_hash: String,
}

/// The subset of store operations the orchestrator drives.
pub trait Store {
    fn parse_store_path(&self, s: &str) -> Result<StorePath, Error>;
    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, Error>;
    fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error>;
    fn query_realisation(&self, output: &DrvOutput) -> Result<Option<Realisation>, Error>;

    /// Queries a realisation against a specific store URI instead of the
    /// default local store, for resolving content-addressed outputs that
    /// the remote node realised but this host has not yet copied in.
    fn query_realisation_from(&self, store_uri: &str, output: &DrvOutput) -> Result<Option<Realisation>, Error>;

    fn register_drv_output(&self, output: &DrvOutput, realisation: &Realisation) -> Result<(), Error>;

    /// Copies the transitive closure of `roots` into `dest_store_uri`.
    fn copy_closure(
        &self,
        dest_store_uri: &str,
        roots: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error>;

    /// Copies exactly `paths` (no closure expansion) into `dest_store_uri`.
    fn copy_paths(
        &self,
        dest_store_uri: &str,
        paths: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error>;

    /// Copies `paths` from `src_store_uri` into the local store.
    fn copy_paths_from(
        &self,
        src_store_uri: &str,
        paths: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error>;
}

/// Shells out to `nix-store`/`nix`, matching the CLI the daemon itself
/// already depends on being present.
#[derive(Clone, Debug)]
pub struct ShellStore {
    pub nix_store_bin: PathBuf,
    pub nix_bin: PathBuf,
}

impl Default for ShellStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ShellStore {
    pub fn new() -> Self {
        Self {
            nix_store_bin: PathBuf::from("nix-store"),
            nix_bin: PathBuf::from("nix"),
        }
    }

    fn run(&self, args: &[&str]) -> Result<String, Error> {
        run_command(&self.nix_store_bin, args)
    }

    fn run_nix(&self, args: &[&str]) -> Result<String, Error> {
        run_command(&self.nix_bin, args)
    }
}

fn run_command(bin: &Path, args: &[&str]) -> Result<String, Error> {
    let command_desc = format!("{} {}", bin.display(), args.join(" "));
    let output = Command::new(bin)
        .args(args)
        .output()
        .map_err(|source| Error::Spawn {
            command: command_desc.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(Error::CommandFailed {
            command: command_desc,
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        });
    }
    String::from_utf8(output.stdout).map_err(|_| Error::Parse)
}

impl Store for ShellStore {
    fn parse_store_path(&self, s: &str) -> Result<StorePath, Error> {
        if !s.starts_with('/') {
            return Err(Error::InvalidStorePath { path: s.to_string() });
        }
        Ok(StorePath(s.to_string()))
    }

    fn read_derivation(&self, path: &StorePath) -> Result<Derivation, Error> {
        let text = self.run_nix(&["derivation", "show", path.as_str()])?;
        parse_derivation_json(&text, path.as_str())
    }

    fn is_valid_path(&self, path: &StorePath) -> Result<bool, Error> {
        let command_desc = format!("{} --check-validity {}", self.nix_store_bin.display(), path.as_str());
        let status = Command::new(&self.nix_store_bin)
            .args(["--check-validity", path.as_str()])
            .status()
            .map_err(|source| Error::Spawn {
                command: command_desc,
                source,
            })?;
        Ok(status.success())
    }

    fn query_realisation(&self, output: &DrvOutput) -> Result<Option<Realisation>, Error> {
        let text = self.run(&["--query", "--realisation", &output.id()])?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(Realisation {
            out_path: StorePath(trimmed.to_string()),
        }))
    }

    fn query_realisation_from(&self, store_uri: &str, output: &DrvOutput) -> Result<Option<Realisation>, Error> {
        let id = output.id();
        let text = self.run(&["--store", store_uri, "--query", "--realisation", &id])?;
        let trimmed = text.trim();
        if trimmed.is_empty() {
            return Ok(None);
        }
        Ok(Some(Realisation {
            out_path: StorePath(trimmed.to_string()),
        }))
    }

    fn register_drv_output(&self, output: &DrvOutput, realisation: &Realisation) -> Result<(), Error> {
        self.run(&[
            "--register-realisation",
            &output.id(),
            realisation.out_path.as_str(),
        ])?;
        Ok(())
    }

    fn copy_closure(
        &self,
        dest_store_uri: &str,
        roots: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error> {
        let mut args = vec!["--to".to_string(), dest_store_uri.to_string()];
        if use_substitutes {
            args.push("--use-substitutes".to_string());
        }
        args.extend(roots.iter().map(|p| p.as_str().to_string()));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs)?;
        Ok(())
    }

    fn copy_paths(
        &self,
        dest_store_uri: &str,
        paths: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error> {
        // Identical invocation shape to copy_closure; nix-store itself
        // distinguishes "just these paths" from "these paths' closures"
        // via whether the caller already expanded the set.
        self.copy_closure(dest_store_uri, paths, use_substitutes)
    }

    fn copy_paths_from(
        &self,
        src_store_uri: &str,
        paths: &[StorePath],
        use_substitutes: bool,
    ) -> Result<(), Error> {
        let mut args = vec!["--from".to_string(), src_store_uri.to_string()];
        if use_substitutes {
            args.push("--use-substitutes".to_string());
        }
        args.extend(paths.iter().map(|p| p.as_str().to_string()));
        let arg_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
        self.run(&arg_refs)?;
        Ok(())
    }
}

#[derive(serde::Deserialize)]
struct RawOutput {
    #[serde(default)]
    path: Option<String>,
}

#[derive(serde::Deserialize)]
struct RawEntry {
    #[serde(default)]
    env: BTreeMap<String, String>,
    #[serde(default)]
    outputs: BTreeMap<String, RawOutput>,
}

/// Parses `nix derivation show <path>`'s JSON, which maps the queried
/// store path to one entry carrying its `env` and `outputs` maps.
/// Content-addressed derivations are distinguished by at least one output
/// lacking a statically-known `path`.
fn parse_derivation_json(text: &str, path: &str) -> Result<Derivation, Error> {
    let parsed: BTreeMap<String, RawEntry> =
        serde_json::from_str(text).map_err(|_| Error::Parse)?;
    let entry = parsed.into_values().next().ok_or(Error::Parse)?;

    let content_addressed = entry.outputs.values().any(|o| o.path.is_none());
    let outputs = entry
        .outputs
        .into_iter()
        .map(|(name, o)| (name, o.path.map(StorePath)))
        .collect();

    Ok(Derivation {
        env: entry.env,
        outputs,
        content_addressed,
        drv_hash: drv_hash_from_path(path),
    })
}

/// Extracts the hash component from a store path's basename, e.g.
/// `/nix/store/abc123-foo.drv` -> `abc123`.
fn drv_hash_from_path(path: &str) -> String {
    path.rsplit('/')
        .next()
        .unwrap_or(path)
        .split_once('-')
        .map(|(hash, _)| hash.to_string())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drv_output_id_format() {
        let o = DrvOutput {
            drv_hash: "abc123".to_string(),
            output_name: "out".to_string(),
        };
        assert_eq!(o.id(), "abc123!out");
    }

    #[test]
    fn parse_store_path_rejects_relative() {
        let store = ShellStore::new();
        assert!(store.parse_store_path("not-absolute").is_err());
        assert!(store
            .parse_store_path("/nix/store/abc-foo")
            .is_ok());
    }

    #[test]
    fn drv_hash_extracted_from_basename() {
        assert_eq!(
            drv_hash_from_path("/nix/store/abc123-foo.drv"),
            "abc123"
        );
    }

    #[test]
    fn input_addressed_derivation_parses_output_paths() {
        let json = r#"{
            "/nix/store/abc123-foo.drv": {
                "env": {"extraSlurmParams": "{\"partition\":\"x\"}"},
                "outputs": {"out": {"path": "/nix/store/def456-foo"}}
            }
        }"#;
        let drv = parse_derivation_json(json, "/nix/store/abc123-foo.drv").unwrap();
        assert!(!drv.content_addressed);
        assert_eq!(drv.drv_hash, "abc123");
        assert_eq!(
            drv.outputs.get("out").unwrap().as_ref().unwrap().as_str(),
            "/nix/store/def456-foo"
        );
        assert_eq!(
            drv.env.get("extraSlurmParams").unwrap(),
            "{\"partition\":\"x\"}"
        );
    }

    #[test]
    fn content_addressed_derivation_has_no_static_output_path() {
        let json = r#"{
            "/nix/store/abc123-foo.drv": {
                "env": {},
                "outputs": {"out": {"method": "recursive", "hashAlgo": "sha256"}}
            }
        }"#;
        let drv = parse_derivation_json(json, "/nix/store/abc123-foo.drv").unwrap();
        assert!(drv.content_addressed);
        assert!(drv.outputs.get("out").unwrap().is_none());
    }
}

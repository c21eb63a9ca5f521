//! Scratch-file naming and the submission-script skeleton shared by all
//! four scheduler backends.

/// Paths to the two files a submitted job leaves behind on the remote
/// node: a GC root keeping the built derivation alive until copy-out, and
/// the job's own stderr log (tailed back to the parent in real time).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ScratchPaths {
    pub root_path: String,
    pub job_stderr: String,
}

pub fn scratch_paths(state_dir: &str, drv_path: &str) -> ScratchPaths {
    let escaped = escape_drv_path(drv_path);
    ScratchPaths {
        root_path: format!("{state_dir}/job-{escaped}.root"),
        job_stderr: format!("{state_dir}/job-{escaped}.stderr"),
    }
}

fn escape_drv_path(drv_path: &str) -> String {
    drv_path
        .trim_start_matches('/')
        .chars()
        .map(|c| if c == '/' { '-' } else { c })
        .collect()
}

/// Builds the shell script every backend submits: wait for the derivation
/// to land in the remote store, realise it onto `root_path`, then emit the
/// sentinel line so the tailing parent knows the build is done.
pub fn generate_script(
    remote_nix_bin_dir: &str,
    store_dir: &str,
    drv_path: &str,
    root_path: &str,
) -> String {
    let nix_store = if remote_nix_bin_dir.is_empty() {
        "nix-store".to_string()
    } else {
        format!("{remote_nix_bin_dir}/nix-store")
    };
    format!(
        "#!/bin/sh\nwhile ! {nix_store} --store {store_dir} --query --hash {drv_path} >/dev/null 2>&1; do\n  sleep 1\ndone\n{nix_store} --realise {drv_path} --add-root {root_path}\nrc=$?\necho '@nsh done' >&2\nexit $rc\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scratch_paths_escape_slashes() {
        let p = scratch_paths("/var/nsh", "/nix/store/abc-foo.drv");
        assert_eq!(p.root_path, "/var/nsh/job-nix-store-abc-foo.drv.root");
        assert_eq!(p.job_stderr, "/var/nsh/job-nix-store-abc-foo.drv.stderr");
    }

    #[test]
    fn script_contains_sentinel_and_add_root() {
        let script = generate_script("", "/nix/store", "/nix/store/abc-foo.drv", "/var/nsh/job.root");
        assert!(script.contains("@nsh done"));
        assert!(script.contains("--add-root /var/nsh/job.root"));
    }
}

//! Engine-level configuration (SPEC_FULL §1 "ambient stack / Configuration"):
//! loaded from `<repo>/engine.toml` via `serde` + `toml`, the same pairing
//! `record_store`/`store`/`process_exec` already use for their own on-disk
//! and wire formats. Rule authoring itself stays an external collaborator
//! (spec §1 Out of scope) — this only covers engine-level knobs.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

fn default_admin_dir() -> PathBuf {
    PathBuf::from("LMAKE")
}

fn default_backend() -> BackendKind {
    BackendKind::Local
}

fn default_heartbeat_secs() -> u64 {
    5
}

fn default_deferred_start_ms() -> u64 {
    200
}

fn default_autodep_method() -> autodep::AutodepMethod {
    autodep::AutodepMethod::LdPreload
}

fn default_local_jobs_cap() -> usize {
    num_cpus::get()
}

fn default_store_map_size() -> usize {
    1 << 30 // 1 GiB; LMDB map size is a virtual reservation, not eager allocation.
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Local,
    Cluster,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Directory holding `store/`, `outputs/`, `tmp/`, `trace/`, and the
    /// `server` lock marker (spec §6 on-disk layout).
    #[serde(default = "default_admin_dir")]
    pub admin_dir: PathBuf,
    #[serde(default = "default_backend")]
    pub backend: BackendKind,
    /// Default per-resource-class pool sizes (§4.G); a rule's own
    /// `resources` only need to be a subset of these keys.
    pub default_resources: BTreeMap<String, u64>,
    #[serde(default = "default_autodep_method")]
    pub autodep_method: autodep::AutodepMethod,
    /// Path to the `LD_PRELOAD`/`LD_AUDIT` shim `.so`, required by
    /// `autodep::tracer::TracerConfig` for either of those two methods;
    /// unused (and may be left unset) under `AutodepMethod::Ptrace`.
    pub autodep_shim_path: Option<PathBuf>,
    pub sandbox: SandboxDefaults,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    pub cache_enabled: bool,
    #[serde(default = "default_deferred_start_ms")]
    pub deferred_start_delay_ms: u64,
    pub trace_verbose: bool,
    /// Pure concurrency throttle independent of resource pools
    /// (SPEC_FULL §4 "4.G+"), mirroring the original's "local jobs" cap.
    #[serde(default = "default_local_jobs_cap")]
    pub local_jobs_cap: usize,
    #[serde(default = "default_store_map_size")]
    pub store_map_size_bytes: usize,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct SandboxDefaults {
    pub chroot_dir: Option<PathBuf>,
    pub keep_tmp: bool,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            admin_dir: default_admin_dir(),
            backend: default_backend(),
            default_resources: BTreeMap::new(),
            autodep_method: default_autodep_method(),
            autodep_shim_path: None,
            sandbox: SandboxDefaults::default(),
            heartbeat_interval_secs: default_heartbeat_secs(),
            cache_enabled: true,
            deferred_start_delay_ms: default_deferred_start_ms(),
            trace_verbose: false,
            local_jobs_cap: default_local_jobs_cap(),
            store_map_size_bytes: default_store_map_size(),
        }
    }
}

impl Config {
    pub fn load(repo_root: &Path) -> Result<Config, String> {
        let path = repo_root.join("engine.toml");
        match std::fs::read_to_string(&path) {
            Ok(text) => toml::from_str(&text).map_err(|e| format!("{}: {e}", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Config::default()),
            Err(e) => Err(format!("reading {}: {e}", path.display())),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn deferred_start_delay(&self) -> Duration {
        Duration::from_millis(self.deferred_start_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_config_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert_eq!(config.backend, BackendKind::Local);
        assert!(config.cache_enabled);
    }

    #[test]
    fn config_file_overrides_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("engine.toml"),
            "cache_enabled = false\nheartbeat_interval_secs = 30\n",
        )
        .unwrap();
        let config = Config::load(dir.path()).unwrap();
        assert!(!config.cache_enabled);
        assert_eq!(config.heartbeat_interval_secs, 30);
    }
}

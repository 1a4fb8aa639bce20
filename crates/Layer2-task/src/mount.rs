//! Mount Composer - isolation surface for the containerized agent
//!
//! The agent wrapper reads its mounts from environment variables:
//!
//! | Set | Variable | Encoding |
//! |---|---|---|
//! | read-write paths | `YARD_RW_PATHS` | `p1:p2` |
//! | read-only paths | `YARD_RO_PATHS` | `p1:p2` |
//! | read-write maps | `YARD_RW_MAPS` | `src=dst:src=dst` |
//! | read-only maps | `YARD_RO_MAPS` | `src=dst:src=dst` |
//!
//! An empty set is absent from the environment. The wrapper treats an unset
//! variable and an empty one differently.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

pub const ENV_RW_PATHS: &str = "YARD_RW_PATHS";
pub const ENV_RO_PATHS: &str = "YARD_RO_PATHS";
pub const ENV_RW_MAPS: &str = "YARD_RW_MAPS";
pub const ENV_RO_MAPS: &str = "YARD_RO_MAPS";
pub const ENV_PASSTHROUGH: &str = "YARD_ENV_PASSTHROUGH";

/// Where the sidecar socket appears inside the container
pub const CONTAINER_DOCKER_SOCKET: &str = "/var/run/docker.sock";

pub const DOCKER_HOST_VAR: &str = "DOCKER_HOST";

/// Parent of the read-only context repo mounts inside the container
pub const CONTEXT_MOUNT_ROOT: &str = "/context";

/// Host source exposed at a fixed container path
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMap {
    pub source: PathBuf,
    pub target: String,
}

impl PathMap {
    pub fn new(source: impl Into<PathBuf>, target: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            target: target.into(),
        }
    }
}

/// Inputs for one run start
#[derive(Debug, Clone, Default)]
pub struct MountInputs {
    /// Task worktree (the agent's home)
    pub worktree: PathBuf,

    /// This run's artifact output directory
    pub artifacts_dir: PathBuf,

    /// Host directory holding the active credential
    pub credential_home: Option<PathBuf>,

    /// Credential home path inside the container
    pub credential_target: String,

    /// Read-only reference worktrees, in task order
    pub context_repos: Vec<PathBuf>,

    pub attachments_dir: Option<PathBuf>,

    /// Present only while a sidecar is active for the run
    pub sidecar_socket: Option<PathBuf>,
}

/// The four mount sets of one run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MountPlan {
    pub rw_paths: Vec<PathBuf>,
    pub ro_paths: Vec<PathBuf>,
    pub rw_maps: Vec<PathMap>,
    pub ro_maps: Vec<PathMap>,
}

impl MountPlan {
    /// Serialize into environment variables; empty sets are omitted
    pub fn to_env(&self) -> BTreeMap<String, String> {
        let mut env = BTreeMap::new();
        insert_joined(&mut env, ENV_RW_PATHS, self.rw_paths.iter().map(path_str));
        insert_joined(&mut env, ENV_RO_PATHS, self.ro_paths.iter().map(path_str));
        insert_joined(&mut env, ENV_RW_MAPS, self.rw_maps.iter().map(map_str));
        insert_joined(&mut env, ENV_RO_MAPS, self.ro_maps.iter().map(map_str));
        env
    }

    pub fn is_empty(&self) -> bool {
        self.rw_paths.is_empty()
            && self.ro_paths.is_empty()
            && self.rw_maps.is_empty()
            && self.ro_maps.is_empty()
    }
}

fn path_str(path: &PathBuf) -> String {
    path.to_string_lossy().to_string()
}

fn map_str(map: &PathMap) -> String {
    format!("{}={}", map.source.to_string_lossy(), map.target)
}

fn insert_joined(env: &mut BTreeMap<String, String>, key: &str, items: impl Iterator<Item = String>) {
    let items: Vec<String> = items.collect();
    if !items.is_empty() {
        env.insert(key.to_string(), items.join(":"));
    }
}

/// Builds a [`MountPlan`] from run inputs
pub trait MountComposer: Send + Sync {
    fn compose(&self, inputs: &MountInputs) -> MountPlan;
}

/// Composer that checks the host filesystem for existence
#[derive(Debug, Clone, Default)]
pub struct HostMountComposer;

impl MountComposer for HostMountComposer {
    fn compose(&self, inputs: &MountInputs) -> MountPlan {
        compose_with(inputs, |p| p.exists())
    }
}

/// Filter to existing paths, dedup, then drop read-only entries already
/// exposed read-write
pub fn compose_with(inputs: &MountInputs, exists: impl Fn(&Path) -> bool) -> MountPlan {
    let mut rw_paths = vec![inputs.worktree.clone(), inputs.artifacts_dir.clone()];
    let mut ro_paths: Vec<PathBuf> = inputs.attachments_dir.iter().cloned().collect();

    let mut rw_maps = Vec::new();
    if let Some(home) = &inputs.credential_home {
        rw_maps.push(PathMap::new(home, inputs.credential_target.clone()));
    }
    if let Some(socket) = &inputs.sidecar_socket {
        rw_maps.push(PathMap::new(socket, CONTAINER_DOCKER_SOCKET));
    }

    let aliases = context_aliases(&inputs.context_repos);
    let mut ro_maps: Vec<PathMap> = inputs
        .context_repos
        .iter()
        .zip(aliases)
        .map(|(path, alias)| PathMap::new(path, format!("{}/{}", CONTEXT_MOUNT_ROOT, alias)))
        .collect();

    rw_paths.retain(|p| exists(p));
    ro_paths.retain(|p| exists(p));
    rw_maps.retain(|m| exists(&m.source));
    ro_maps.retain(|m| exists(&m.source));

    dedup_by_key(&mut rw_paths, |p| p.clone());
    dedup_by_key(&mut ro_paths, |p| p.clone());
    dedup_by_key(&mut rw_maps, |m| m.source.clone());
    dedup_by_key(&mut ro_maps, |m| m.source.clone());

    let rw_path_set: HashSet<&PathBuf> = rw_paths.iter().collect();
    ro_paths.retain(|p| !rw_path_set.contains(p));
    let rw_sources: HashSet<&PathBuf> = rw_maps.iter().map(|m| &m.source).collect();
    ro_maps.retain(|m| !rw_sources.contains(&m.source));

    MountPlan {
        rw_paths,
        ro_paths,
        rw_maps,
        ro_maps,
    }
}

fn dedup_by_key<T, K: Eq + std::hash::Hash>(items: &mut Vec<T>, key: impl Fn(&T) -> K) {
    let mut seen = HashSet::new();
    items.retain(|item| seen.insert(key(item)));
}

/// Collision-free aliases: first keeps its base name, later ones get `-2`, `-3`
pub fn context_aliases(paths: &[PathBuf]) -> Vec<String> {
    let mut taken: HashSet<String> = HashSet::new();
    paths
        .iter()
        .map(|path| {
            let base = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| "repo".to_string());
            let mut alias = base.clone();
            let mut n = 2;
            while !taken.insert(alias.clone()) {
                alias = format!("{}-{}", base, n);
                n += 1;
            }
            alias
        })
        .collect()
}

// ============================================================================
// RunConfig
// ============================================================================

/// Everything needed to spawn one agent process
///
/// Built once per run start and handed down to the launcher, which is the
/// only place it becomes a real process environment.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub stdout_log: PathBuf,
    pub stderr_log: PathBuf,
}

impl RunConfig {
    pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: cwd.into(),
            env: BTreeMap::new(),
            stdout_log: PathBuf::new(),
            stderr_log: PathBuf::new(),
        }
    }

    pub fn with_args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    pub fn with_env(mut self, env: BTreeMap<String, String>) -> Self {
        self.env = env;
        self
    }

    pub fn with_logs(mut self, stdout: impl Into<PathBuf>, stderr: impl Into<PathBuf>) -> Self {
        self.stdout_log = stdout.into();
        self.stderr_log = stderr.into();
        self
    }
}

/// Final agent environment: mount plan, verbatim overrides and the
/// passthrough allow-list naming every variable that must cross into the
/// container
pub fn agent_env(
    plan: &MountPlan,
    overrides: &BTreeMap<String, String>,
    sidecar_active: bool,
) -> BTreeMap<String, String> {
    let mut env = plan.to_env();
    let mut passthrough: Vec<String> = Vec::new();

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
        passthrough.push(key.clone());
    }

    if sidecar_active {
        env.insert(
            DOCKER_HOST_VAR.to_string(),
            format!("unix://{}", CONTAINER_DOCKER_SOCKET),
        );
        if !passthrough.iter().any(|k| k == DOCKER_HOST_VAR) {
            passthrough.push(DOCKER_HOST_VAR.to_string());
        }
    }

    if !passthrough.is_empty() {
        env.insert(ENV_PASSTHROUGH.to_string(), passthrough.join(":"));
    }
    env
}

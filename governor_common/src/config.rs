//! Configuration model, loading and validation.
//!
//! One YAML file describes one machine: its devices, its named states,
//! the initial (fault-safe) state, and the staged transitions between
//! states. A second, optional YAML file holds the sync map shared by all
//! loaded machines.
//!
//! Validation is exhaustive: `validate()` walks the whole document and
//! returns every problem found, so an operator fixing a config sees the
//! full list at once instead of one error per run.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Error type for configuration loading and validation.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// Configuration file not found at the given path.
    #[error("configuration file not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// YAML parsing failed.
    #[error("failed to parse configuration: {0}")]
    Parse(String),

    /// Semantic validation failed; every problem found is listed.
    #[error("configuration invalid:\n  {}", .0.join("\n  "))]
    Invalid(Vec<String>),
}

/// Kind of positioner behind a device key.
///
/// The YAML spelling of the no-op kind is `Device`, kept for
/// compatibility with existing machine files.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeviceKind {
    /// Single continuous coordinate with numeric setpoints.
    Motor,
    /// Binary open/close positioner.
    Valve,
    /// Placeholder that completes every move instantly.
    #[serde(rename = "Device")]
    Dummy,
}

/// One device entry under `devices:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DeviceConfig {
    /// Positioner kind.
    #[serde(rename = "type")]
    pub kind: DeviceKind,
    /// Human-readable name.
    pub name: String,
    /// PV address prefix of the underlying record.
    pub pv: String,
    /// Readback tolerance in user units. Motor only.
    #[serde(default)]
    pub tolerance: Option<f64>,
    /// Move timeout in seconds.
    pub timeout: f64,
    /// Named setpoints. Motor and Dummy only; valves carry the implicit
    /// pair Open/Closed.
    #[serde(default)]
    pub positions: BTreeMap<String, f64>,
}

/// Per-device binding inside a state: which target holds the device and
/// how far the readback may stray while the state is held.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TargetBinding {
    /// Target name on the bound device.
    pub target: String,
    /// Additive window `[lo, hi]` around the live setpoint, `lo <= 0 <= hi`.
    pub limits: [f64; 2],
    /// Write the readback back into the target cell after a clean arrival.
    #[serde(rename = "updateAfter", default)]
    pub update_after: bool,
}

/// One state entry under `states:`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StateConfig {
    /// Human-readable name.
    pub name: String,
    /// Device bindings. The initial state carries none.
    #[serde(default)]
    pub targets: BTreeMap<String, TargetBinding>,
}

/// One stage of a transition: a single device key, or a list of keys
/// moved concurrently.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StageSpec {
    /// Singleton stage.
    Single(String),
    /// Parallel stage.
    Parallel(Vec<String>),
}

impl StageSpec {
    /// Device keys of this stage in declaration order.
    pub fn devices(&self) -> &[String] {
        match self {
            Self::Single(key) => std::slice::from_ref(key),
            Self::Parallel(keys) => keys,
        }
    }
}

/// Top-level machine configuration, one YAML file per machine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GovernorConfig {
    /// Machine name, unique among the loaded configs.
    pub name: String,
    /// Devices keyed by short key.
    pub devices: BTreeMap<String, DeviceConfig>,
    /// States keyed by short key.
    pub states: BTreeMap<String, StateConfig>,
    /// Key of the initial (fault-safe) state.
    pub init_state: String,
    /// Stage lists keyed by `transitions[from][to]`.
    #[serde(default)]
    pub transitions: BTreeMap<String, BTreeMap<String, Vec<StageSpec>>>,
}

/// Sync map: device key to the target names shared across machines.
pub type SyncMap = BTreeMap<String, Vec<String>>;

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound(path.to_path_buf())
        } else {
            ConfigError::Parse(e.to_string())
        }
    })
}

impl GovernorConfig {
    /// Load one machine configuration from a YAML file.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = read_file(path)?;
        Self::from_yaml(&content)
    }

    /// Parse one machine configuration from a YAML string.
    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        serde_yaml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Validate the whole document, returning every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut problems = Vec::new();

        if self.name.is_empty() {
            problems.push("machine name must not be empty".to_string());
        }

        for (key, dev) in &self.devices {
            if !(dev.timeout > 0.0) {
                problems.push(format!("device `{key}`: timeout must be positive"));
            }
            match dev.kind {
                DeviceKind::Motor => {
                    if dev.tolerance.is_some_and(|t| t < 0.0) {
                        problems.push(format!("device `{key}`: tolerance must be non-negative"));
                    }
                }
                DeviceKind::Valve => {
                    if !dev.positions.is_empty() {
                        problems.push(format!(
                            "device `{key}`: valves carry the implicit Open/Closed pair, \
                             `positions` is not allowed"
                        ));
                    }
                    if dev.tolerance.is_some() {
                        problems.push(format!("device `{key}`: tolerance is motor-only"));
                    }
                }
                DeviceKind::Dummy => {
                    if dev.tolerance.is_some() {
                        problems.push(format!("device `{key}`: tolerance is motor-only"));
                    }
                }
            }
        }

        match self.states.get(&self.init_state) {
            None => problems.push(format!("init_state `{}` is not a defined state", self.init_state)),
            Some(init) if !init.targets.is_empty() => {
                problems.push(format!(
                    "init_state `{}` must not bind devices",
                    self.init_state
                ));
            }
            Some(_) => {}
        }

        for (skey, state) in &self.states {
            for (dkey, binding) in &state.targets {
                let Some(dev) = self.devices.get(dkey) else {
                    problems.push(format!("state `{skey}`: unknown device `{dkey}`"));
                    continue;
                };
                let target_ok = match dev.kind {
                    DeviceKind::Valve => {
                        matches!(binding.target.as_str(), "Open" | "Closed")
                    }
                    DeviceKind::Motor | DeviceKind::Dummy => {
                        dev.positions.contains_key(&binding.target)
                    }
                };
                if !target_ok {
                    problems.push(format!(
                        "state `{skey}`: device `{dkey}` has no target named `{}`",
                        binding.target
                    ));
                }
                let [lo, hi] = binding.limits;
                if !(lo <= 0.0 && 0.0 <= hi) {
                    problems.push(format!(
                        "state `{skey}`: device `{dkey}` limits [{lo}, {hi}] must straddle zero"
                    ));
                }
            }
        }

        for (from, tos) in &self.transitions {
            if !self.states.contains_key(from) {
                problems.push(format!("transition source `{from}` is not a defined state"));
            }
            for (to, stages) in tos {
                if !self.states.contains_key(to) {
                    problems.push(format!(
                        "transition `{from}` -> `{to}`: destination is not a defined state"
                    ));
                    continue;
                }
                if *to == self.init_state {
                    problems.push(format!(
                        "transition `{from}` -> `{to}`: the initial state is reachable \
                         implicitly and must not have explicit inbound transitions"
                    ));
                }
                let mut seen = BTreeSet::new();
                for (idx, stage) in stages.iter().enumerate() {
                    if stage.devices().is_empty() {
                        problems.push(format!(
                            "transition `{from}` -> `{to}`: stage {idx} is empty"
                        ));
                    }
                    for dkey in stage.devices() {
                        if !self.devices.contains_key(dkey) {
                            problems.push(format!(
                                "transition `{from}` -> `{to}`: unknown device `{dkey}`"
                            ));
                        }
                        if !seen.insert(dkey.clone()) {
                            problems.push(format!(
                                "transition `{from}` -> `{to}`: device `{dkey}` appears in \
                                 more than one stage"
                            ));
                        }
                        let bound = self
                            .states
                            .get(to)
                            .map(|s| s.targets.contains_key(dkey))
                            .unwrap_or(false);
                        if !bound {
                            problems.push(format!(
                                "transition `{from}` -> `{to}`: device `{dkey}` has no \
                                 binding on the destination state"
                            ));
                        }
                    }
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Invalid(problems))
        }
    }
}

/// Load the sync map from a YAML file.
pub fn load_sync(path: &Path) -> Result<SyncMap, ConfigError> {
    let content = read_file(path)?;
    serde_yaml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
}

/// Check the sync map against every loaded machine.
///
/// A machine that does not define a synced device is skipped (fan-out
/// skips it too); a machine that defines the device but not the target
/// is a configuration error.
pub fn validate_sync(configs: &[GovernorConfig], sync: &SyncMap) -> Result<(), ConfigError> {
    let mut problems = Vec::new();
    for (dkey, targets) in sync {
        for cfg in configs {
            let Some(dev) = cfg.devices.get(dkey) else {
                continue;
            };
            for tname in targets {
                let known = match dev.kind {
                    DeviceKind::Valve => matches!(tname.as_str(), "Open" | "Closed"),
                    DeviceKind::Motor | DeviceKind::Dummy => dev.positions.contains_key(tname),
                };
                if !known {
                    problems.push(format!(
                        "machine `{}`: sync entry `{dkey}:{tname}` names an unknown target",
                        cfg.name
                    ));
                }
            }
        }
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems))
    }
}

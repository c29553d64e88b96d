//! Compiled machines.
//!
//! A [`Machine`] is the immutable arena built from one validated
//! configuration: devices behind their IO backends, states with their
//! per-device bindings, and the staged transition table. Cross-references
//! are string keys; traversal is always top-down, so nothing here holds a
//! back-pointer. The mutable pieces (current state, status) live in the
//! controller.

use crate::device::{Device, DeviceIo, TargetValue};
use crate::target::TargetStore;
use governor_common::config::{DeviceConfig, DeviceKind, GovernorConfig};
use governor_common::state::{MachineStatus, ValvePosition};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::watch;

/// Per-device binding of a state: which target holds the device and the
/// allowed window around its live setpoint.
#[derive(Debug, Clone)]
pub struct Binding {
    /// Target name on the bound device.
    pub target: String,
    /// Lower window offset, `<= 0`.
    pub low: f64,
    /// Upper window offset, `>= 0`.
    pub high: f64,
    /// Write the readback back into the target cell after a clean
    /// arrival.
    pub update_after: bool,
}

/// One named configuration of the envelope.
#[derive(Debug, Clone)]
pub struct StateDef {
    /// Human-readable name.
    pub name: String,
    /// Bindings keyed by device key. Empty for the initial state.
    pub bindings: BTreeMap<String, Binding>,
}

/// One compiled state machine.
pub struct Machine {
    /// Machine name, unique among the loaded configs.
    pub name: String,
    /// Devices keyed by short key.
    pub devices: BTreeMap<String, Arc<Device>>,
    /// States keyed by short key.
    pub states: BTreeMap<String, StateDef>,
    /// Stage lists keyed by `(from, to)`.
    pub transitions: BTreeMap<String, BTreeMap<String, Vec<Vec<String>>>>,
    /// Key of the initial (fault-safe) state.
    pub init_state: String,
    /// Shared target store.
    pub store: Arc<TargetStore>,
}

impl Machine {
    /// Build the arena from a validated configuration.
    ///
    /// `io_for` supplies the channel-access backend per device; tests
    /// inject simulators with fault knobs, the binary wires defaults.
    pub fn compile(
        cfg: &GovernorConfig,
        store: Arc<TargetStore>,
        io_for: &mut dyn FnMut(&str, &DeviceConfig) -> Arc<dyn DeviceIo>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let devices = cfg
            .devices
            .iter()
            .map(|(key, dev_cfg)| {
                let io = io_for(key, dev_cfg);
                (key.clone(), Device::new(key, dev_cfg, io, shutdown.clone()))
            })
            .collect();

        let states = cfg
            .states
            .iter()
            .map(|(key, st)| {
                let bindings = st
                    .targets
                    .iter()
                    .map(|(dkey, b)| {
                        let binding = Binding {
                            target: b.target.clone(),
                            low: b.limits[0],
                            high: b.limits[1],
                            update_after: b.update_after,
                        };
                        (dkey.clone(), binding)
                    })
                    .collect();
                (key.clone(), StateDef { name: st.name.clone(), bindings })
            })
            .collect();

        let transitions = cfg
            .transitions
            .iter()
            .map(|(from, tos)| {
                let tos = tos
                    .iter()
                    .map(|(to, stages)| {
                        let stages = stages.iter().map(|s| s.devices().to_vec()).collect();
                        (to.clone(), stages)
                    })
                    .collect();
                (from.clone(), tos)
            })
            .collect();

        Arc::new(Self {
            name: cfg.name.clone(),
            devices,
            states,
            transitions,
            init_state: cfg.init_state.clone(),
            store,
        })
    }

    /// Stage list of the transition `(from, to)`, if defined.
    pub fn stages(&self, from: &str, to: &str) -> Option<&Vec<Vec<String>>> {
        self.transitions.get(from)?.get(to)
    }

    /// Resolve a device target name to its live value.
    ///
    /// Motor and placeholder targets read the store; valve targets are
    /// the discrete Open/Closed pair.
    pub fn resolve(&self, device_key: &str, target: &str) -> Option<TargetValue> {
        let dev = self.devices.get(device_key)?;
        match dev.kind {
            DeviceKind::Valve => ValvePosition::from_target(target).map(TargetValue::Valve),
            DeviceKind::Motor | DeviceKind::Dummy => self
                .store
                .get(&self.name, device_key, target)
                .map(TargetValue::Numeric),
        }
    }

    /// States a fresh `Go` could be accepted for, given the current
    /// state and status.
    ///
    /// The initial state stays listed through Busy and FAULT (it is the
    /// recovery destination); a Disabled machine advertises nothing.
    pub fn reachable(&self, current: &str, status: MachineStatus) -> Vec<String> {
        match status {
            MachineStatus::Disabled => Vec::new(),
            MachineStatus::Busy | MachineStatus::Fault => vec![self.init_state.clone()],
            MachineStatus::Idle => {
                let mut out = vec![self.init_state.clone()];
                if let Some(tos) = self.transitions.get(current) {
                    for to in tos.keys() {
                        if *to != self.init_state {
                            out.push(to.clone());
                        }
                    }
                }
                out
            }
        }
    }

    /// Check that every device bound by `state_key` is connected, homed
    /// and inside its window. Returns the violations otherwise.
    pub fn held(&self, state_key: &str) -> Result<(), Vec<(String, String)>> {
        let Some(state) = self.states.get(state_key) else {
            return Err(vec![(state_key.to_string(), "UNKNOWN_STATE".into())]);
        };
        let mut violations = Vec::new();
        for (dkey, binding) in &state.bindings {
            let Some(dev) = self.devices.get(dkey) else {
                continue;
            };
            if !dev.connected() {
                violations.push((dkey.clone(), "DISCONNECTED".into()));
                continue;
            }
            if !dev.homed() {
                violations.push((dkey.clone(), "NOT_HOMED".into()));
                continue;
            }
            match self.resolve(dkey, &binding.target) {
                None => violations.push((dkey.clone(), "NO_SETPOINT".into())),
                Some(tv) => {
                    if !dev.within(tv, binding.low, binding.high) {
                        violations.push((dkey.clone(), "OUT_OF_WINDOW".into()));
                    }
                }
            }
        }
        if violations.is_empty() {
            Ok(())
        } else {
            Err(violations)
        }
    }
}

//! The Governor supervisor.
//!
//! Owns every loaded machine and enforces the single-active invariant:
//! at most one machine is enabled at a time, so at most one machine can
//! ever issue `start_move` even when machines reference the same
//! physical positioner. Switching the selected machine is refused while
//! any machine is Busy; deactivating the Governor disables all machines.

use crate::controller::{self, MachineHandle};
use crate::device::{DeviceIo, sim::SimIo};
use crate::machine::Machine;
use crate::target::TargetStore;
use governor_common::config::{DeviceConfig, DeviceKind, GovernorConfig, SyncMap};
use governor_common::error::GovernorError;
use governor_common::state::ValvePosition;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn};

/// Default simulated motor velocity, user units per second.
const SIM_MOTOR_VELOCITY: f64 = 20.0;
/// Default simulated valve actuation time.
const SIM_VALVE_TRAVEL: Duration = Duration::from_secs(1);

/// Default channel-access backend: one simulated positioner per device.
///
/// The production transport plugs in through the same [`DeviceIo`] seam.
pub fn sim_io_factory() -> impl FnMut(&str, &DeviceConfig) -> Arc<dyn DeviceIo> {
    |_key: &str, cfg: &DeviceConfig| -> Arc<dyn DeviceIo> {
        match cfg.kind {
            DeviceKind::Motor => SimIo::motor(SIM_MOTOR_VELOCITY),
            DeviceKind::Valve => SimIo::valve(SIM_VALVE_TRAVEL, ValvePosition::Closed),
            DeviceKind::Dummy => SimIo::dummy(),
        }
    }
}

struct Selection {
    active_idx: usize,
    active: bool,
}

/// The process-wide supervisor: all machines, the selection, the sync
/// store and the shutdown signal.
pub struct Governor {
    machines: Vec<MachineHandle>,
    store: Arc<TargetStore>,
    selection: Mutex<Selection>,
    shutdown_tx: watch::Sender<bool>,
}

impl std::fmt::Debug for Governor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Governor").finish_non_exhaustive()
    }
}

impl Governor {
    /// Validate the configs, compile every machine and spawn its
    /// controller, then select the first machine as active.
    pub fn build(
        configs: &[GovernorConfig],
        sync: SyncMap,
        io_for: &mut dyn FnMut(&str, &str, &DeviceConfig) -> Arc<dyn DeviceIo>,
    ) -> Result<Arc<Self>, GovernorError> {
        validate_configs(configs, &sync)?;

        let names: Vec<String> = configs.iter().map(|c| c.name.clone()).collect();
        let store = TargetStore::new(names, sync);
        for cfg in configs {
            store.seed(cfg);
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let machines: Vec<MachineHandle> = configs
            .iter()
            .map(|cfg| {
                let mut per_machine =
                    |key: &str, dev: &DeviceConfig| io_for(&cfg.name, key, dev);
                let machine =
                    Machine::compile(cfg, store.clone(), &mut per_machine, shutdown_rx.clone());
                controller::spawn(machine, shutdown_rx.clone())
            })
            .collect();

        let gov = Arc::new(Self {
            machines,
            store,
            selection: Mutex::new(Selection { active_idx: 0, active: true }),
            shutdown_tx,
        });
        gov.machines[0].set_enabled(true);
        info!(machine = %gov.machines[0].name(), "governor up, machine selected");
        Ok(gov)
    }

    /// All machine handles, in load order.
    pub fn machines(&self) -> &[MachineHandle] {
        &self.machines
    }

    /// Handle of the named machine.
    pub fn machine(&self, name: &str) -> Option<&MachineHandle> {
        self.machines.iter().find(|m| m.name() == name)
    }

    /// Handle of the currently selected machine.
    pub fn selected(&self) -> &MachineHandle {
        &self.machines[self.selection.lock().active_idx]
    }

    /// The shared target store.
    pub fn store(&self) -> &Arc<TargetStore> {
        &self.store
    }

    /// True while any machine is Busy.
    pub fn any_busy(&self) -> bool {
        self.machines.iter().any(|m| m.is_busy())
    }

    /// Global Active/Inactive flag.
    pub fn is_active(&self) -> bool {
        self.selection.lock().active
    }

    /// Switch the selected machine. Refused while any machine is Busy.
    pub fn select_machine(&self, name: &str) -> Result<(), GovernorError> {
        let idx = self
            .machines
            .iter()
            .position(|m| m.name() == name)
            .ok_or_else(|| GovernorError::CommandRejected(format!("no machine named {name}")))?;
        if self.any_busy() {
            warn!(%name, "machine selection refused while busy");
            return Err(GovernorError::CommandRejected(
                "cannot switch machines while a transition is in progress".to_string(),
            ));
        }
        let mut sel = self.selection.lock();
        if sel.active_idx != idx {
            self.machines[sel.active_idx].set_enabled(false);
            sel.active_idx = idx;
            if sel.active {
                self.machines[idx].set_enabled(true);
            }
        }
        info!(machine = %name, "machine selected");
        Ok(())
    }

    /// Set the global Active/Inactive flag.
    ///
    /// Inactive disables every machine; a running transition is aborted
    /// first and the machine enters Disabled once motion has ceased.
    pub fn set_active(&self, active: bool) {
        let mut sel = self.selection.lock();
        if sel.active == active {
            return;
        }
        sel.active = active;
        let selected = &self.machines[sel.active_idx];
        if active {
            selected.set_enabled(true);
        } else {
            if selected.is_busy() {
                selected.abort();
            }
            for m in &self.machines {
                m.set_enabled(false);
            }
        }
        info!(active, "governor active flag changed");
    }

    /// Forward an abort to the selected machine.
    pub fn abort(&self) {
        self.selected().abort();
    }

    /// Orderly shutdown: abort everything, then signal every task.
    pub fn kill(&self) {
        info!("kill requested, shutting down");
        for m in &self.machines {
            if m.is_busy() {
                m.abort();
            }
        }
        let _ = self.shutdown_tx.send(true);
    }

    /// Watch the shutdown signal.
    pub fn shutdown_rx(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }
}

/// Validate every config plus the sync map, collecting all problems
/// across files into one error.
pub fn validate_configs(configs: &[GovernorConfig], sync: &SyncMap) -> Result<(), GovernorError> {
    use governor_common::config::ConfigError;

    if configs.is_empty() {
        return Err(ConfigError::Invalid(vec!["no machine configurations given".into()]).into());
    }
    let mut problems = Vec::new();
    for (i, cfg) in configs.iter().enumerate() {
        if configs[..i].iter().any(|c| c.name == cfg.name) {
            problems.push(format!("duplicate machine name `{}`", cfg.name));
        }
        if let Err(ConfigError::Invalid(list)) = cfg.validate() {
            problems.extend(list.into_iter().map(|p| format!("{}: {p}", cfg.name)));
        }
    }
    if let Err(ConfigError::Invalid(list)) = governor_common::config::validate_sync(configs, sync) {
        problems.extend(list);
    }
    if problems.is_empty() {
        Ok(())
    } else {
        Err(ConfigError::Invalid(problems).into())
    }
}

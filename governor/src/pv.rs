//! PV binding layer.
//!
//! Translates the internal object graph into the published channel
//! namespace and routes writes back as commands. The PV server library
//! proper sits behind [`PvRegistry`]: it is an in-process map of named
//! cells, each backed by a watch channel so a server frontend (or a
//! test) can observe every update eagerly.
//!
//! Naming schema, relative to the configured prefix:
//!
//! | Scope | Pattern |
//! |---|---|
//! | global | `{Gov}` |
//! | machine | `{Gov:NAME}` |
//! | device | `{Gov:NAME-Dev:KEY}` |
//! | state | `{Gov:NAME-St:KEY}` |
//! | transition | `{Gov:NAME-Tr:FROM-TO}` |
//!
//! Suffixes: `-Sel` read/write enumeration, `-Cmd` write-only command,
//! `-Sts` read-only status, `-I` read-only informational, `-Pos`
//! read/write number.

use crate::controller::{MachineHandle, MachineReport};
use crate::supervisor::Governor;
use crate::target::TargetUpdate;
use governor_common::config::DeviceKind;
use governor_common::error::GovernorError;
use governor_common::state::MachineStatus;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tracing::{debug, warn};

/// Value carried by one channel.
#[derive(Debug, Clone, PartialEq)]
pub enum PvValue {
    /// Numeric channel (`-Pos`, boolean `-Sts`).
    Number(f64),
    /// String channel (enumerations, messages, state keys).
    Text(String),
    /// List channel (`-I` lists).
    List(Vec<String>),
}

impl PvValue {
    /// Text constructor.
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text(s.into())
    }

    /// Numeric view, accepting numeric text.
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Self::Number(v) => Some(*v),
            Self::Text(s) => s.trim().parse().ok(),
            Self::List(_) => None,
        }
    }

    /// Text view.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }
}

/// Global scope: `{Gov}`.
pub fn gov_scope(prefix: &str) -> String {
    format!("{prefix}{{Gov}}")
}

/// Machine scope: `{Gov:NAME}`.
pub fn machine_scope(prefix: &str, machine: &str) -> String {
    format!("{prefix}{{Gov:{machine}}}")
}

/// Device scope: `{Gov:NAME-Dev:KEY}`.
pub fn device_scope(prefix: &str, machine: &str, device: &str) -> String {
    format!("{prefix}{{Gov:{machine}-Dev:{device}}}")
}

/// State scope: `{Gov:NAME-St:KEY}`.
pub fn state_scope(prefix: &str, machine: &str, state: &str) -> String {
    format!("{prefix}{{Gov:{machine}-St:{state}}}")
}

/// Transition scope: `{Gov:NAME-Tr:FROM-TO}`.
pub fn transition_scope(prefix: &str, machine: &str, from: &str, to: &str) -> String {
    format!("{prefix}{{Gov:{machine}-Tr:{from}-{to}}}")
}

/// In-process registry of named cells.
///
/// Each cell is a watch channel: `set` replaces the value, subscribers
/// see every change after the underlying state change is visible.
#[derive(Default)]
pub struct PvRegistry {
    cells: RwLock<HashMap<String, watch::Sender<PvValue>>>,
}

impl PvRegistry {
    fn declare(&self, name: String, initial: PvValue) {
        let (tx, _) = watch::channel(initial);
        self.cells.write().insert(name, tx);
    }

    fn set(&self, name: &str, value: PvValue) {
        match self.cells.read().get(name) {
            Some(tx) => {
                tx.send_replace(value);
            }
            None => warn!(%name, "update for undeclared channel"),
        }
    }

    /// Current value of a channel.
    pub fn get(&self, name: &str) -> Option<PvValue> {
        self.cells.read().get(name).map(|tx| tx.borrow().clone())
    }

    /// Watch a channel.
    pub fn subscribe(&self, name: &str) -> Option<watch::Receiver<PvValue>> {
        self.cells.read().get(name).map(|tx| tx.subscribe())
    }

    /// All declared channel names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.cells.read().keys().cloned().collect();
        names.sort();
        names
    }
}

#[derive(Debug, Clone)]
enum Route {
    Go(usize),
    MachineAbort(usize),
    GlobalAbort,
    Kill,
    ActiveSel,
    ConfigSel,
    TargetPos {
        machine: String,
        device: String,
        target: String,
    },
}

/// The binding: declared channels, write routes and republish tasks.
pub struct PvBinding {
    registry: Arc<PvRegistry>,
    routes: HashMap<String, Route>,
    gov: Arc<Governor>,
    prefix: String,
}

impl PvBinding {
    /// Declare every channel for the loaded machines, spawn the
    /// republish tasks and build the write routing table.
    pub fn new(gov: Arc<Governor>, prefix: &str) -> Arc<Self> {
        let registry = Arc::new(PvRegistry::default());
        let mut routes = HashMap::new();
        let shutdown = gov.shutdown_rx();

        let g = gov_scope(prefix);
        let names: Vec<String> = gov.machines().iter().map(|m| m.name().to_string()).collect();
        registry.declare(format!("{g}Sts:Configs-I"), PvValue::List(names.clone()));
        registry.declare(format!("{g}Sts:Msg-I"), PvValue::text(""));
        registry.declare(format!("{g}Active-Sel"), PvValue::text("Active"));
        registry.declare(format!("{g}Config-Sel"), PvValue::text(names[0].clone()));
        registry.declare(format!("{g}Cmd:Abort-Cmd"), PvValue::Number(0.0));
        registry.declare(format!("{g}Cmd:Kill-Cmd"), PvValue::Number(0.0));
        routes.insert(format!("{g}Active-Sel"), Route::ActiveSel);
        routes.insert(format!("{g}Config-Sel"), Route::ConfigSel);
        routes.insert(format!("{g}Cmd:Abort-Cmd"), Route::GlobalAbort);
        routes.insert(format!("{g}Cmd:Kill-Cmd"), Route::Kill);

        for (idx, handle) in gov.machines().iter().enumerate() {
            let mname = handle.name().to_string();
            let scope = machine_scope(prefix, &mname);
            registry.declare(format!("{scope}Cmd:Go-Cmd"), PvValue::text(""));
            registry.declare(format!("{scope}Cmd:Abort-Cmd"), PvValue::Number(0.0));
            routes.insert(format!("{scope}Cmd:Go-Cmd"), Route::Go(idx));
            routes.insert(format!("{scope}Cmd:Abort-Cmd"), Route::MachineAbort(idx));

            let report = handle.report();
            registry.declare(format!("{scope}Sts:Status-Sts"), PvValue::text(report.status.label()));
            registry.declare(format!("{scope}Sts:State-I"), PvValue::text(report.state.clone()));
            registry.declare(format!("{scope}Sts:Reach-I"), PvValue::List(report.reachable.clone()));
            registry.declare(format!("{scope}Sts:Msg-I"), PvValue::text(report.message.clone()));
            registry.declare(format!("{scope}Sts:Tr-I"), PvValue::text(""));

            for skey in handle.machine.states.keys() {
                registry.declare(
                    format!("{}Sts:Reach-Sts", state_scope(prefix, &mname, skey)),
                    PvValue::Number(0.0),
                );
            }
            for (from, tos) in &handle.machine.transitions {
                for to in tos.keys() {
                    registry.declare(
                        format!("{}Sts:Reach-Sts", transition_scope(prefix, &mname, from, to)),
                        PvValue::Number(0.0),
                    );
                }
            }

            for (dkey, dev) in &handle.machine.devices {
                let dscope = device_scope(prefix, &mname, dkey);
                registry.declare(format!("{dscope}Sts:Conn-Sts"), PvValue::Number(0.0));
                registry.declare(format!("{dscope}Sts:Pos-I"), PvValue::Number(0.0));
                if dev.kind != DeviceKind::Valve {
                    for tname in target_names(handle, dkey) {
                        let cell = format!("{dscope}Pos:{tname}-Pos");
                        let value = gov
                            .store()
                            .get(&mname, dkey, &tname)
                            .map(PvValue::Number)
                            .unwrap_or(PvValue::Number(0.0));
                        registry.declare(cell.clone(), value);
                        routes.insert(
                            cell,
                            Route::TargetPos {
                                machine: mname.clone(),
                                device: dkey.clone(),
                                target: tname,
                            },
                        );
                    }
                }
                spawn_device_republish(
                    registry.clone(),
                    dscope,
                    dev.clone(),
                    shutdown.clone(),
                );
            }

            spawn_machine_republish(
                registry.clone(),
                prefix.to_string(),
                handle.clone(),
                shutdown.clone(),
            );
        }

        spawn_store_republish(registry.clone(), prefix.to_string(), gov.clone(), shutdown);

        Arc::new(Self {
            registry,
            routes,
            gov,
            prefix: prefix.to_string(),
        })
    }

    /// The channel registry (served by the bus frontend).
    pub fn registry(&self) -> &Arc<PvRegistry> {
        &self.registry
    }

    /// Decode a write to a `-Sel`, `-Cmd` or `-Pos` channel and route it.
    pub fn handle_write(&self, name: &str, value: PvValue) -> Result<(), GovernorError> {
        let Some(route) = self.routes.get(name) else {
            return Err(GovernorError::CommandRejected(format!(
                "no writable channel named {name}"
            )));
        };
        debug!(%name, ?value, "pv write");
        match route {
            Route::Go(idx) => {
                let target = value.as_text().ok_or_else(|| {
                    GovernorError::CommandRejected("Go-Cmd expects a state name".into())
                })?;
                self.gov.machines()[*idx].go(target);
                Ok(())
            }
            Route::MachineAbort(idx) => {
                self.gov.machines()[*idx].abort();
                Ok(())
            }
            Route::GlobalAbort => {
                self.gov.abort();
                Ok(())
            }
            Route::Kill => {
                self.gov.kill();
                Ok(())
            }
            Route::ActiveSel => {
                let active = match (value.as_text(), value.as_number()) {
                    (Some("Active"), _) => true,
                    (Some("Inactive"), _) => false,
                    (_, Some(v)) => v != 0.0,
                    _ => {
                        return Err(GovernorError::CommandRejected(
                            "Active-Sel expects Active or Inactive".into(),
                        ));
                    }
                };
                self.gov.set_active(active);
                self.registry.set(
                    name,
                    PvValue::text(if active { "Active" } else { "Inactive" }),
                );
                Ok(())
            }
            Route::ConfigSel => {
                let target = value.as_text().ok_or_else(|| {
                    GovernorError::CommandRejected("Config-Sel expects a machine name".into())
                })?;
                match self.gov.select_machine(target) {
                    Ok(()) => {
                        self.registry.set(name, PvValue::text(target));
                        Ok(())
                    }
                    Err(e) => {
                        let g = gov_scope(&self.prefix);
                        self.registry.set(&format!("{g}Sts:Msg-I"), PvValue::text(e.to_string()));
                        Err(e)
                    }
                }
            }
            Route::TargetPos { machine, device, target } => {
                let v = value.as_number().ok_or_else(|| {
                    GovernorError::CommandRejected("-Pos expects a number".into())
                })?;
                if self.gov.store().set(machine, device, target, v) {
                    Ok(())
                } else {
                    Err(GovernorError::CommandRejected(format!(
                        "no target cell {machine}/{device}/{target}"
                    )))
                }
            }
        }
    }
}

fn target_names(handle: &MachineHandle, device: &str) -> Vec<String> {
    // Every name the store was seeded with for this device, whether or
    // not a state references it.
    handle.machine.store.targets(handle.name(), device)
}

fn publish_report(
    registry: &PvRegistry,
    prefix: &str,
    handle: &MachineHandle,
    report: &MachineReport,
) {
    let mname = handle.name();
    let scope = machine_scope(prefix, mname);
    registry.set(&format!("{scope}Sts:Status-Sts"), PvValue::text(report.status.label()));
    registry.set(&format!("{scope}Sts:State-I"), PvValue::text(report.state.clone()));
    registry.set(&format!("{scope}Sts:Reach-I"), PvValue::List(report.reachable.clone()));
    registry.set(&format!("{scope}Sts:Msg-I"), PvValue::text(report.message.clone()));
    let edge = report
        .transition
        .as_ref()
        .map(|(f, t)| format!("{f}->{t}"))
        .unwrap_or_default();
    registry.set(&format!("{scope}Sts:Tr-I"), PvValue::text(edge));

    for skey in handle.machine.states.keys() {
        let reachable = report.reachable.iter().any(|s| s == skey);
        registry.set(
            &format!("{}Sts:Reach-Sts", state_scope(prefix, mname, skey)),
            PvValue::Number(if reachable { 1.0 } else { 0.0 }),
        );
    }
    for (from, tos) in &handle.machine.transitions {
        for to in tos.keys() {
            let reachable = *from == report.state && report.status == MachineStatus::Idle;
            registry.set(
                &format!("{}Sts:Reach-Sts", transition_scope(prefix, mname, from, to)),
                PvValue::Number(if reachable { 1.0 } else { 0.0 }),
            );
        }
    }
}

fn spawn_machine_republish(
    registry: Arc<PvRegistry>,
    prefix: String,
    handle: MachineHandle,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut rx = handle.subscribe();
        loop {
            let report = rx.borrow().clone();
            publish_report(&registry, &prefix, &handle, &report);
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_device_republish(
    registry: Arc<PvRegistry>,
    dscope: String,
    dev: Arc<crate::device::Device>,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut rx = dev.subscribe();
        loop {
            let snap = *rx.borrow();
            registry.set(
                &format!("{dscope}Sts:Conn-Sts"),
                PvValue::Number(if snap.connected { 1.0 } else { 0.0 }),
            );
            let pos = match snap.reading {
                crate::device::Reading::Position(v) => PvValue::Number(v),
                crate::device::Reading::Valve(v) => PvValue::text(v.label()),
            };
            registry.set(&format!("{dscope}Sts:Pos-I"), pos);
            tokio::select! {
                res = rx.changed() => {
                    if res.is_err() {
                        break;
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

fn spawn_store_republish(
    registry: Arc<PvRegistry>,
    prefix: String,
    gov: Arc<Governor>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut rx = gov.store().subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                update = rx.recv() => match update {
                    Ok(TargetUpdate { machine, device, target, value }) => {
                        let cell = format!(
                            "{}Pos:{target}-Pos",
                            device_scope(&prefix, &machine, &device)
                        );
                        registry.set(&cell, PvValue::Number(value));
                    }
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "target update stream lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn naming_schema() {
        assert_eq!(gov_scope("BL:"), "BL:{Gov}");
        assert_eq!(machine_scope("", "Human"), "{Gov:Human}");
        assert_eq!(device_scope("BL:", "Human", "gx"), "BL:{Gov:Human-Dev:gx}");
        assert_eq!(state_scope("", "Human", "SA"), "{Gov:Human-St:SA}");
        assert_eq!(
            transition_scope("", "Human", "M", "SA"),
            "{Gov:Human-Tr:M-SA}"
        );
    }

    #[test]
    fn registry_set_and_get() {
        let reg = PvRegistry::default();
        reg.declare("{Gov}Sts:Msg-I".into(), PvValue::text(""));
        reg.set("{Gov}Sts:Msg-I", PvValue::text("hello"));
        assert_eq!(reg.get("{Gov}Sts:Msg-I"), Some(PvValue::text("hello")));
        assert_eq!(reg.get("{Gov}Nope"), None);
    }

    #[test]
    fn registry_subscribers_see_updates() {
        let reg = PvRegistry::default();
        reg.declare("cell".into(), PvValue::Number(0.0));
        let rx = reg.subscribe("cell").unwrap();
        reg.set("cell", PvValue::Number(2.0));
        assert_eq!(*rx.borrow(), PvValue::Number(2.0));
    }

    #[test]
    fn pv_value_number_parsing() {
        assert_eq!(PvValue::Number(1.5).as_number(), Some(1.5));
        assert_eq!(PvValue::text("2.5").as_number(), Some(2.5));
        assert_eq!(PvValue::text("SE").as_number(), None);
        assert_eq!(PvValue::List(vec![]).as_number(), None);
    }
}

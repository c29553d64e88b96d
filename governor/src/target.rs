//! Target setpoint store.
//!
//! One process-wide store holds every (machine, device, target) cell.
//! All mutation goes through [`TargetStore::set`], which takes the single
//! store lock, applies the write, and fans it out to the matching cell of
//! every other machine when the (device, target) pair is in the sync map.
//! Peers are written inside the same critical section, so a synced write
//! is applied everywhere before the next write is admitted and never
//! re-fans.

use governor_common::config::{DeviceKind, GovernorConfig, SyncMap};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::debug;

/// One applied setpoint write, as seen by the PV layer.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetUpdate {
    /// Machine owning the written cell.
    pub machine: String,
    /// Device key.
    pub device: String,
    /// Target name.
    pub target: String,
    /// New setpoint.
    pub value: f64,
}

type CellKey = (String, String, String);

/// Process-wide store of target setpoints.
pub struct TargetStore {
    cells: Mutex<HashMap<CellKey, f64>>,
    sync: SyncMap,
    machines: Vec<String>,
    updates: broadcast::Sender<TargetUpdate>,
}

impl TargetStore {
    /// Create the store for the given machine names and sync map, then
    /// seed it with [`TargetStore::seed`] per config.
    pub fn new(machines: Vec<String>, sync: SyncMap) -> Arc<Self> {
        let (updates, _) = broadcast::channel(256);
        Arc::new(Self {
            cells: Mutex::new(HashMap::new()),
            sync,
            machines,
            updates,
        })
    }

    /// Insert the configured positions of one machine.
    pub fn seed(&self, cfg: &GovernorConfig) {
        let mut cells = self.cells.lock();
        for (dkey, dev) in &cfg.devices {
            if dev.kind == DeviceKind::Valve {
                continue;
            }
            for (tname, value) in &dev.positions {
                cells.insert((cfg.name.clone(), dkey.clone(), tname.clone()), *value);
            }
        }
    }

    /// Current setpoint of a cell.
    pub fn get(&self, machine: &str, device: &str, target: &str) -> Option<f64> {
        self.cells
            .lock()
            .get(&(machine.to_string(), device.to_string(), target.to_string()))
            .copied()
    }

    /// Write a cell and fan out through the sync map.
    ///
    /// Returns false when the origin cell does not exist (unknown
    /// machine/device/target); nothing is written in that case.
    pub fn set(&self, machine: &str, device: &str, target: &str, value: f64) -> bool {
        let mut applied = Vec::new();
        {
            let mut cells = self.cells.lock();
            let origin = (machine.to_string(), device.to_string(), target.to_string());
            if !cells.contains_key(&origin) {
                return false;
            }
            cells.insert(origin, value);
            applied.push(TargetUpdate {
                machine: machine.to_string(),
                device: device.to_string(),
                target: target.to_string(),
                value,
            });

            let synced = self
                .sync
                .get(device)
                .is_some_and(|targets| targets.iter().any(|t| t == target));
            if synced {
                for peer in &self.machines {
                    if peer == machine {
                        continue;
                    }
                    let key = (peer.clone(), device.to_string(), target.to_string());
                    if let std::collections::hash_map::Entry::Occupied(mut e) = cells.entry(key) {
                        e.insert(value);
                        applied.push(TargetUpdate {
                            machine: peer.clone(),
                            device: device.to_string(),
                            target: target.to_string(),
                            value,
                        });
                    }
                }
            }
        }
        for update in applied {
            debug!(
                machine = %update.machine,
                device = %update.device,
                target = %update.target,
                value = update.value,
                "target setpoint updated"
            );
            let _ = self.updates.send(update);
        }
        true
    }

    /// Names of the seeded targets of one device, sorted.
    pub fn targets(&self, machine: &str, device: &str) -> Vec<String> {
        let cells = self.cells.lock();
        let mut names: Vec<String> = cells
            .keys()
            .filter(|(m, d, _)| m == machine && d == device)
            .map(|(_, _, t)| t.clone())
            .collect();
        names.sort();
        names
    }

    /// Subscribe to applied writes (PV republish).
    pub fn subscribe(&self) -> broadcast::Receiver<TargetUpdate> {
        self.updates.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use governor_common::config::GovernorConfig;

    fn two_machines() -> (Arc<TargetStore>, GovernorConfig, GovernorConfig) {
        let yaml = |name: &str| {
            format!(
                r#"
name: {name}
devices:
  li:
    type: Motor
    name: Light
    pv: "SIM{{Light}}"
    tolerance: 0.1
    timeout: 10
    positions:
      Up: 0.0
      Down: -96.0
states:
  M: {{name: Maintenance}}
init_state: M
"#
            )
        };
        let human = GovernorConfig::from_yaml(&yaml("Human")).unwrap();
        let robot = GovernorConfig::from_yaml(&yaml("Robot")).unwrap();
        let mut sync = SyncMap::new();
        sync.insert("li".into(), vec!["Up".into()]);
        let store = TargetStore::new(vec!["Human".into(), "Robot".into()], sync);
        store.seed(&human);
        store.seed(&robot);
        (store, human, robot)
    }

    #[test]
    fn seeded_cells_are_readable() {
        let (store, _, _) = two_machines();
        assert_eq!(store.get("Human", "li", "Up"), Some(0.0));
        assert_eq!(store.get("Robot", "li", "Down"), Some(-96.0));
        assert_eq!(store.get("Human", "li", "Sideways"), None);
    }

    #[test]
    fn synced_write_reaches_every_machine() {
        let (store, _, _) = two_machines();
        assert!(store.set("Human", "li", "Up", 7.0));
        assert_eq!(store.get("Human", "li", "Up"), Some(7.0));
        assert_eq!(store.get("Robot", "li", "Up"), Some(7.0));
    }

    #[test]
    fn unsynced_write_stays_local() {
        let (store, _, _) = two_machines();
        assert!(store.set("Human", "li", "Down", -90.0));
        assert_eq!(store.get("Human", "li", "Down"), Some(-90.0));
        assert_eq!(store.get("Robot", "li", "Down"), Some(-96.0));
    }

    #[test]
    fn unknown_cell_is_refused() {
        let (store, _, _) = two_machines();
        assert!(!store.set("Human", "li", "Sideways", 1.0));
        assert!(!store.set("Ghost", "li", "Up", 1.0));
    }

    #[tokio::test]
    async fn updates_are_broadcast_per_applied_write() {
        let (store, _, _) = two_machines();
        let mut rx = store.subscribe();
        store.set("Robot", "li", "Up", 3.5);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        let mut machines = vec![first.machine, second.machine];
        machines.sort();
        assert_eq!(machines, ["Human", "Robot"]);
        assert_eq!(first.value, 3.5);
    }
}

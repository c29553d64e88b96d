//! Device drivers.
//!
//! A [`Device`] wraps one physical positioner behind the narrow
//! [`DeviceIo`] seam (the raw motor-record / valve protocol lives on the
//! far side of that trait). Each device runs one long-lived poll task
//! that samples the underlying channels and publishes a
//! [`DeviceSnapshot`] over a watch channel; everything else in the
//! runtime reads those snapshots without blocking.
//!
//! Motor motion is inferred, not trusted: two consecutive poll samples
//! that differ by more than [`MOTION_EPSILON`] count as motion. Valves
//! report motion through their status word.

use governor_common::config::{DeviceConfig, DeviceKind};
use governor_common::state::ValvePosition;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::trace;

pub mod sim;

/// Poll period for motor readbacks.
pub const MOTOR_POLL: Duration = Duration::from_millis(100);
/// Poll period for valve status words.
pub const VALVE_POLL: Duration = Duration::from_millis(250);

/// Consecutive samples differing by more than this count as motion.
pub const MOTION_EPSILON: f64 = 1e-9;

/// Raw reading from the underlying channel layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Reading {
    /// Continuous coordinate (motors, placeholders).
    Position(f64),
    /// Discrete valve state.
    Valve(ValvePosition),
}

impl Reading {
    /// Numeric view of the reading, if it has one.
    pub fn position(&self) -> Option<f64> {
        match self {
            Self::Position(v) => Some(*v),
            Self::Valve(_) => None,
        }
    }
}

/// Demand issued to the underlying channel layer.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Demand {
    /// Write a numeric setpoint.
    Position(f64),
    /// Assert the open command line.
    Open,
    /// Assert the close command line.
    Close,
}

/// Resolved move target: a live numeric setpoint or a discrete valve
/// position.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TargetValue {
    /// Motor / placeholder setpoint.
    Numeric(f64),
    /// Valve position.
    Valve(ValvePosition),
}

/// The channel-access seam.
///
/// One implementation per transport; the in-tree one is the simulated
/// positioner in [`sim`]. All methods are non-blocking reads or
/// fire-and-forget commands.
pub trait DeviceIo: Send + Sync {
    /// True iff all underlying PVs are live.
    fn connected(&self) -> bool;

    /// False iff the motor controller reports the axis unhomed.
    fn homed(&self) -> bool {
        true
    }

    /// Current raw reading.
    fn reading(&self) -> Reading;

    /// Motor travel limits, when the record publishes them.
    fn limits(&self) -> Option<(f64, f64)> {
        None
    }

    /// Issue a move command.
    fn demand(&self, demand: Demand);

    /// Best-effort halt. Valves ignore this.
    fn stop(&self);
}

/// Last-polled view of a device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeviceSnapshot {
    /// All underlying PVs live.
    pub connected: bool,
    /// Axis homed (always true for valves and placeholders).
    pub homed: bool,
    /// Raw reading at the last poll.
    pub reading: Reading,
    /// Motion inferred from the last two polls (motor) or the status
    /// word (valve).
    pub moving: bool,
}

/// One positioner under Governor control.
pub struct Device {
    /// Short key, unique within a machine.
    pub key: String,
    /// Positioner kind.
    pub kind: DeviceKind,
    /// Human-readable name.
    pub name: String,
    /// PV address prefix.
    pub pv: String,
    /// Readback tolerance (zero for valves and placeholders).
    pub tolerance: f64,
    /// Per-move timeout.
    pub timeout: Duration,
    io: Arc<dyn DeviceIo>,
    snapshot_rx: watch::Receiver<DeviceSnapshot>,
}

impl Device {
    /// Wrap an IO backend and spawn the readback poll task.
    ///
    /// The task exits when `shutdown` flips true or its sender drops.
    pub fn new(
        key: &str,
        cfg: &DeviceConfig,
        io: Arc<dyn DeviceIo>,
        shutdown: watch::Receiver<bool>,
    ) -> Arc<Self> {
        let initial = DeviceSnapshot {
            connected: io.connected(),
            homed: io.homed(),
            reading: io.reading(),
            moving: false,
        };
        let (tx, rx) = watch::channel(initial);
        let period = match cfg.kind {
            DeviceKind::Valve => VALVE_POLL,
            DeviceKind::Motor | DeviceKind::Dummy => MOTOR_POLL,
        };
        spawn_poll_task(key.to_string(), cfg.kind, io.clone(), tx, period, shutdown);
        Arc::new(Self {
            key: key.to_string(),
            kind: cfg.kind,
            name: cfg.name.clone(),
            pv: cfg.pv.clone(),
            tolerance: cfg.tolerance.unwrap_or(0.0),
            timeout: Duration::from_secs_f64(cfg.timeout),
            io,
            snapshot_rx: rx,
        })
    }

    /// Last-polled view.
    pub fn snapshot(&self) -> DeviceSnapshot {
        *self.snapshot_rx.borrow()
    }

    /// Watch the snapshot stream (for the PV layer).
    pub fn subscribe(&self) -> watch::Receiver<DeviceSnapshot> {
        self.snapshot_rx.clone()
    }

    /// True iff all underlying PVs are live.
    pub fn connected(&self) -> bool {
        self.snapshot().connected
    }

    /// False iff the motor controller reports the axis unhomed.
    pub fn homed(&self) -> bool {
        self.snapshot().homed
    }

    /// Motion inferred at the last poll.
    pub fn moving(&self) -> bool {
        self.snapshot().moving
    }

    /// Motor travel limits, when published.
    pub fn limits(&self) -> Option<(f64, f64)> {
        self.io.limits()
    }

    /// Readback within `setpoint ± tolerance` (motor), equal to the
    /// discrete target (valve), always true for placeholders.
    pub fn at(&self, target: TargetValue) -> bool {
        self.within(target, 0.0, 0.0)
    }

    /// Readback within `[setpoint+lo-tol, setpoint+hi+tol]`.
    pub fn within(&self, target: TargetValue, lo: f64, hi: f64) -> bool {
        if self.kind == DeviceKind::Dummy {
            return true;
        }
        match (self.snapshot().reading, target) {
            (Reading::Position(rb), TargetValue::Numeric(sp)) => {
                rb >= sp + lo - self.tolerance && rb <= sp + hi + self.tolerance
            }
            (Reading::Valve(rb), TargetValue::Valve(want)) => rb == want,
            _ => false,
        }
    }

    /// Issue the underlying move command.
    pub fn start_move(&self, target: TargetValue) {
        trace!(device = %self.key, ?target, "start_move");
        match target {
            TargetValue::Numeric(v) => self.io.demand(Demand::Position(v)),
            TargetValue::Valve(ValvePosition::Open) => self.io.demand(Demand::Open),
            TargetValue::Valve(ValvePosition::Closed) => self.io.demand(Demand::Close),
            // Moving/Unknown are readback-only; validation never binds them.
            TargetValue::Valve(_) => {}
        }
    }

    /// Best-effort halt.
    pub fn stop(&self) {
        trace!(device = %self.key, "stop");
        self.io.stop();
    }
}

fn spawn_poll_task(
    key: String,
    kind: DeviceKind,
    io: Arc<dyn DeviceIo>,
    tx: watch::Sender<DeviceSnapshot>,
    period: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        let mut prev: Option<f64> = None;
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let reading = io.reading();
                    let moving = match (kind, reading) {
                        (DeviceKind::Motor, Reading::Position(cur)) => {
                            let m = prev.is_some_and(|p| (cur - p).abs() > MOTION_EPSILON);
                            prev = Some(cur);
                            m
                        }
                        (_, Reading::Valve(v)) => v == ValvePosition::Moving,
                        _ => false,
                    };
                    let snap = DeviceSnapshot {
                        connected: io.connected(),
                        homed: io.homed(),
                        reading,
                        moving,
                    };
                    tx.send_replace(snap);
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        trace!(device = %key, "poll task stopping");
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::sim::SimIo;
    use super::*;
    use governor_common::config::DeviceKind;
    use std::collections::BTreeMap;

    fn motor_cfg(tolerance: f64) -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Motor,
            name: "test motor".into(),
            pv: "SIM{Mtr:1}".into(),
            tolerance: Some(tolerance),
            timeout: 5.0,
            positions: BTreeMap::new(),
        }
    }

    fn valve_cfg() -> DeviceConfig {
        DeviceConfig {
            kind: DeviceKind::Valve,
            name: "test valve".into(),
            pv: "SIM{Vlv:1}".into(),
            tolerance: None,
            timeout: 5.0,
            positions: BTreeMap::new(),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn motor_window_math() {
        let (_tx, shutdown) = watch::channel(false);
        let io = SimIo::motor(10.0).with_start(1.0);
        let dev = Device::new("gx", &motor_cfg(0.05), io, shutdown);
        // Let the poll task publish a sample.
        tokio::time::sleep(Duration::from_millis(150)).await;

        assert!(dev.at(TargetValue::Numeric(1.0)));
        assert!(dev.at(TargetValue::Numeric(1.04)));
        assert!(!dev.at(TargetValue::Numeric(1.2)));
        // Window [2.0 - 1.5 - 0.05, 2.0 + 0.5 + 0.05] contains 1.0.
        assert!(dev.within(TargetValue::Numeric(2.0), -1.5, 0.5));
        assert!(!dev.within(TargetValue::Numeric(3.0), -1.5, 0.5));
    }

    #[tokio::test(start_paused = true)]
    async fn motor_motion_is_inferred_from_samples() {
        let (_tx, shutdown) = watch::channel(false);
        let io = SimIo::motor(5.0);
        let dev = Device::new("gx", &motor_cfg(0.01), io.clone(), shutdown);
        tokio::time::sleep(Duration::from_millis(250)).await;
        assert!(!dev.moving(), "no demand yet");

        dev.start_move(TargetValue::Numeric(10.0));
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dev.moving(), "samples should differ while travelling");

        // 10 units at 5 units/s: done after 2 s; two further polls settle
        // the inference.
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(!dev.moving());
        assert!(dev.at(TargetValue::Numeric(10.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn phantom_motion_never_clears() {
        let (_tx, shutdown) = watch::channel(false);
        let io = SimIo::motor(5.0);
        let dev = Device::new("gx", &motor_cfg(0.01), io.clone(), shutdown);
        io.set_phantom(true);
        dev.start_move(TargetValue::Numeric(10.0));

        // Motion is inferred on every sample pair, indefinitely, while
        // the readback stays where it was.
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dev.moving());
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(dev.moving());
        let pos = dev.snapshot().reading.position().unwrap();
        assert!(pos.abs() < 1e-3, "readback drifted to {pos}");
        assert!(!dev.at(TargetValue::Numeric(10.0)));
    }

    #[tokio::test(start_paused = true)]
    async fn valve_reports_motion_then_position() {
        let (_tx, shutdown) = watch::channel(false);
        let io = SimIo::valve(Duration::from_secs(1), ValvePosition::Closed);
        let dev = Device::new("sh", &valve_cfg(), io, shutdown);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(dev.at(TargetValue::Valve(ValvePosition::Closed)));

        dev.start_move(TargetValue::Valve(ValvePosition::Open));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(dev.moving());
        assert!(!dev.at(TargetValue::Valve(ValvePosition::Open)));

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(!dev.moving());
        assert!(dev.at(TargetValue::Valve(ValvePosition::Open)));
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_is_visible_in_snapshots() {
        let (_tx, shutdown) = watch::channel(false);
        let io = SimIo::motor(5.0);
        let dev = Device::new("gx", &motor_cfg(0.01), io.clone(), shutdown);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(dev.connected());

        io.set_connected(false);
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(!dev.connected());
    }
}

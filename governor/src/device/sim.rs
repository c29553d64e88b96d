//! Simulated positioner backend.
//!
//! Constant-velocity kinematics for motors, a fixed actuation time for
//! valves, instant completion for placeholders. Fault injection knobs
//! (disconnect, unhomed, stuck readback, phantom motion) drive the
//! failure-path tests.
//!
//! All timing uses `tokio::time::Instant` so the simulation follows the
//! paused test clock.

use super::{Demand, DeviceIo, Reading};
use governor_common::config::DeviceKind;
use governor_common::state::ValvePosition;
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::time::Instant;

/// Process-wide ordering of demands across all simulated devices; the
/// paused test clock can put several demands on the same instant.
static DEMAND_SEQ: AtomicU64 = AtomicU64::new(0);

/// Readback wobble of a phantom-moving motor. Above the sample-diff
/// motion epsilon, far below any realistic tolerance band.
const PHANTOM_DITHER: f64 = 1e-6;

/// One recorded demand.
#[derive(Debug, Clone, Copy)]
pub struct DemandRecord {
    /// When the demand arrived.
    pub at: Instant,
    /// Global arrival order.
    pub seq: u64,
    /// The demand itself.
    pub demand: Demand,
}

/// One active constant-velocity leg.
#[derive(Debug, Clone, Copy)]
struct Motion {
    from: f64,
    to: f64,
    t0: Instant,
}

#[derive(Debug)]
struct SimState {
    connected: bool,
    homed: bool,
    stuck: bool,
    phantom: bool,
    phantom_flip: bool,
    limits: Option<(f64, f64)>,
    pos: f64,
    motion: Option<Motion>,
    valve: ValvePosition,
    valve_motion: Option<(ValvePosition, Instant)>,
    demands: Vec<DemandRecord>,
}

/// Simulated device IO.
pub struct SimIo {
    kind: DeviceKind,
    velocity: f64,
    travel: Duration,
    state: Mutex<SimState>,
}

impl SimIo {
    fn new(kind: DeviceKind, velocity: f64, travel: Duration, valve: ValvePosition) -> Arc<Self> {
        Arc::new(Self {
            kind,
            velocity,
            travel,
            state: Mutex::new(SimState {
                connected: true,
                homed: true,
                stuck: false,
                phantom: false,
                phantom_flip: false,
                limits: None,
                pos: 0.0,
                motion: None,
                valve,
                valve_motion: None,
                demands: Vec::new(),
            }),
        })
    }

    /// Motor travelling at `velocity` user units per second.
    pub fn motor(velocity: f64) -> Arc<Self> {
        Self::new(DeviceKind::Motor, velocity, Duration::ZERO, ValvePosition::Unknown)
    }

    /// Valve taking `travel` to actuate, starting at `initial`.
    pub fn valve(travel: Duration, initial: ValvePosition) -> Arc<Self> {
        Self::new(DeviceKind::Valve, 0.0, travel, initial)
    }

    /// Placeholder that completes every move instantly.
    pub fn dummy() -> Arc<Self> {
        Self::new(DeviceKind::Dummy, 0.0, Duration::ZERO, ValvePosition::Unknown)
    }

    /// Set the starting position.
    pub fn with_start(self: Arc<Self>, pos: f64) -> Arc<Self> {
        self.state.lock().pos = pos;
        self
    }

    /// Publish motor travel limits.
    pub fn with_limits(self: Arc<Self>, lo: f64, hi: f64) -> Arc<Self> {
        self.state.lock().limits = Some((lo, hi));
        self
    }

    /// Fault injection: connection state of the underlying PVs.
    pub fn set_connected(&self, connected: bool) {
        self.state.lock().connected = connected;
    }

    /// Fault injection: homed flag of the motor controller.
    pub fn set_homed(&self, homed: bool) {
        self.state.lock().homed = homed;
    }

    /// Fault injection: freeze the readback; demands are logged but the
    /// position never changes, so the sample inference never sees
    /// motion.
    pub fn set_stuck(&self, stuck: bool) {
        let mut st = self.state.lock();
        if stuck {
            let now = Instant::now();
            st.pos = position_at(&st, self.velocity, now);
            st.motion = None;
        }
        st.stuck = stuck;
    }

    /// Fault injection: never clear motion. The readback wobbles by
    /// [`PHANTOM_DITHER`] on every sample, so the sample inference
    /// reports motion indefinitely while the position goes nowhere.
    pub fn set_phantom(&self, phantom: bool) {
        let mut st = self.state.lock();
        if phantom {
            let now = Instant::now();
            st.pos = position_at(&st, self.velocity, now);
            st.motion = None;
        }
        st.phantom = phantom;
    }

    /// Teleport the readback (clears any active motion).
    pub fn set_position(&self, pos: f64) {
        let mut st = self.state.lock();
        st.pos = pos;
        st.motion = None;
    }

    /// Every demand issued so far, in arrival order.
    pub fn demands(&self) -> Vec<DemandRecord> {
        self.state.lock().demands.clone()
    }

    /// Timestamp of the most recent demand.
    pub fn last_demand_at(&self) -> Option<Instant> {
        self.state.lock().demands.last().map(|r| r.at)
    }

    /// Global sequence number of the most recent demand.
    pub fn last_demand_seq(&self) -> Option<u64> {
        self.state.lock().demands.last().map(|r| r.seq)
    }
}

/// Position along the active leg at `now`, without settling state.
fn position_at(st: &SimState, velocity: f64, now: Instant) -> f64 {
    match st.motion {
        None => st.pos,
        Some(Motion { from, to, t0 }) => {
            let dist = to - from;
            let travelled = velocity * now.saturating_duration_since(t0).as_secs_f64();
            if travelled >= dist.abs() {
                to
            } else {
                from + dist.signum() * travelled
            }
        }
    }
}

impl DeviceIo for SimIo {
    fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn homed(&self) -> bool {
        self.state.lock().homed
    }

    fn reading(&self) -> Reading {
        let mut st = self.state.lock();
        match self.kind {
            DeviceKind::Motor | DeviceKind::Dummy => {
                if st.phantom {
                    st.phantom_flip = !st.phantom_flip;
                    let dither = if st.phantom_flip { PHANTOM_DITHER } else { -PHANTOM_DITHER };
                    return Reading::Position(st.pos + dither);
                }
                if st.stuck {
                    return Reading::Position(st.pos);
                }
                let now = Instant::now();
                let pos = position_at(&st, self.velocity, now);
                if let Some(m) = st.motion {
                    if pos == m.to {
                        st.pos = pos;
                        st.motion = None;
                    }
                }
                Reading::Position(pos)
            }
            DeviceKind::Valve => {
                let now = Instant::now();
                if let Some((target, t0)) = st.valve_motion {
                    if now.saturating_duration_since(t0) >= self.travel {
                        st.valve = target;
                        st.valve_motion = None;
                    } else {
                        return Reading::Valve(ValvePosition::Moving);
                    }
                }
                Reading::Valve(st.valve)
            }
        }
    }

    fn limits(&self) -> Option<(f64, f64)> {
        self.state.lock().limits
    }

    fn demand(&self, demand: Demand) {
        let mut st = self.state.lock();
        let now = Instant::now();
        let seq = DEMAND_SEQ.fetch_add(1, Ordering::SeqCst);
        st.demands.push(DemandRecord { at: now, seq, demand });
        if st.stuck || st.phantom {
            return;
        }
        match (self.kind, demand) {
            (DeviceKind::Motor, Demand::Position(to)) => {
                let from = position_at(&st, self.velocity, now);
                st.pos = from;
                st.motion = Some(Motion { from, to, t0: now });
            }
            (DeviceKind::Dummy, Demand::Position(to)) => {
                st.pos = to;
                st.motion = None;
            }
            (DeviceKind::Valve, Demand::Open) => {
                st.valve_motion = Some((ValvePosition::Open, now));
            }
            (DeviceKind::Valve, Demand::Close) => {
                st.valve_motion = Some((ValvePosition::Closed, now));
            }
            _ => {}
        }
    }

    fn stop(&self) {
        let mut st = self.state.lock();
        if self.kind == DeviceKind::Valve {
            return;
        }
        let now = Instant::now();
        st.pos = position_at(&st, self.velocity, now);
        st.motion = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn motor_travels_at_constant_velocity() {
        let io = SimIo::motor(2.0);
        io.demand(Demand::Position(10.0));
        tokio::time::advance(Duration::from_secs(1)).await;
        assert_eq!(io.reading(), Reading::Position(2.0));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(io.reading(), Reading::Position(10.0));
    }

    #[tokio::test(start_paused = true)]
    async fn motor_stop_halts_where_it_is() {
        let io = SimIo::motor(2.0);
        io.demand(Demand::Position(10.0));
        tokio::time::advance(Duration::from_secs(2)).await;
        io.stop();
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(io.reading(), Reading::Position(4.0));
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_motor_freezes_readback() {
        let io = SimIo::motor(2.0).with_start(3.0);
        io.set_stuck(true);
        io.demand(Demand::Position(10.0));
        tokio::time::advance(Duration::from_secs(5)).await;
        assert_eq!(io.reading(), Reading::Position(3.0));
    }

    #[tokio::test(start_paused = true)]
    async fn phantom_motor_wobbles_without_progress() {
        let io = SimIo::motor(2.0).with_start(3.0);
        io.set_phantom(true);
        io.demand(Demand::Position(10.0));
        tokio::time::advance(Duration::from_secs(5)).await;

        // Consecutive samples differ, but the position never approaches
        // the demand.
        let Reading::Position(a) = io.reading() else { panic!("numeric readback") };
        let Reading::Position(b) = io.reading() else { panic!("numeric readback") };
        assert!((a - b).abs() > super::super::MOTION_EPSILON);
        assert!((a - 3.0).abs() < 1e-3 && (b - 3.0).abs() < 1e-3);
    }

    #[tokio::test(start_paused = true)]
    async fn valve_actuates_after_travel_time() {
        let io = SimIo::valve(Duration::from_secs(1), ValvePosition::Closed);
        assert_eq!(io.reading(), Reading::Valve(ValvePosition::Closed));
        io.demand(Demand::Open);
        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(io.reading(), Reading::Valve(ValvePosition::Moving));
        tokio::time::advance(Duration::from_millis(600)).await;
        assert_eq!(io.reading(), Reading::Valve(ValvePosition::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn dummy_completes_instantly() {
        let io = SimIo::dummy();
        io.demand(Demand::Position(7.5));
        assert_eq!(io.reading(), Reading::Position(7.5));
    }
}

//! Transition executor.
//!
//! Takes one transition plan (an ordered list of stages, each a set of
//! devices moved concurrently) and drives it to completion. Stages are
//! barriers; within a stage every demand is issued before any waiting
//! happens.
//!
//! Per-device waiting discipline:
//! - Motor: the deadline is re-armed on every poll that observes
//!   progress, a new closest approach of the readback to the setpoint.
//!   Slow but progressing moves never trip it; motion that goes nowhere
//!   is bounded exactly like no motion at all. Completion is `moving()`
//!   false and `at(target)` true. Motion that ceases outside the window
//!   is MISSED_TARGET; a move that never completes, whether the driver
//!   reports motion or not, is TIMEOUT once the deadline lapses. A
//!   demand outside the record's own limits is MISSED_TARGET at issue
//!   time.
//! - Valve: one fixed deadline bounds the whole actuation; completion is
//!   readback equality.
//! - Placeholders complete on the first poll.
//!
//! The abort flag is level-triggered: checked between stages and on
//! every poll. On abort the executor stops what is still moving and
//! waits for motion to cease before returning.

use crate::device::{Reading, TargetValue};
use crate::machine::Machine;
use governor_common::config::DeviceKind;
use governor_common::error::MoveFailure;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Poll period of the stage wait loop.
pub const EXEC_POLL: Duration = Duration::from_millis(50);

/// Result of one executed transition.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome {
    /// Every stage finished and the destination holds.
    Complete,
    /// The failure path was taken; one entry per failed device.
    Failed(Vec<(String, MoveFailure)>),
    /// The abort signal arrived and all motion has ceased.
    Aborted,
}

struct DeviceWait {
    dev: Arc<crate::device::Device>,
    target: TargetValue,
    deadline: Instant,
    /// Closest approach of the readback to the setpoint so far; only a
    /// new closest approach counts as progress and re-arms the deadline.
    best_dist: f64,
    seen_motion: bool,
    done: bool,
}

/// Execute the transition `(from, to)` on `machine`.
///
/// The caller has already checked that the transition is defined and
/// that the machine is idle; this function only sequences the motion.
pub async fn run_transition(
    machine: Arc<Machine>,
    from: String,
    to: String,
    abort: Arc<AtomicBool>,
) -> TransitionOutcome {
    let stages = machine.stages(&from, &to).cloned().unwrap_or_default();
    let Some(dest) = machine.states.get(&to) else {
        return TransitionOutcome::Failed(Vec::new());
    };

    for (idx, stage) in stages.iter().enumerate() {
        if abort.load(Ordering::SeqCst) {
            return TransitionOutcome::Aborted;
        }
        debug!(machine = %machine.name, %from, %to, stage = idx, devices = ?stage, "stage start");

        // Resolve and bounds-check the whole stage before issuing any
        // demand, so a doomed stage moves nothing.
        let mut pending: Vec<(Arc<crate::device::Device>, TargetValue)> = Vec::new();
        let mut failures: Vec<(String, MoveFailure)> = Vec::new();
        for key in stage {
            let Some(dev) = machine.devices.get(key) else {
                continue;
            };
            let Some(binding) = dest.bindings.get(key) else {
                continue;
            };
            let Some(target) = machine.resolve(key, &binding.target) else {
                failures.push((key.clone(), MoveFailure::MissedTarget));
                continue;
            };
            if let (TargetValue::Numeric(sp), Some((lo, hi))) = (target, dev.limits()) {
                if sp < lo || sp > hi {
                    warn!(device = %key, setpoint = sp, "demand outside motor limits");
                    failures.push((key.clone(), MoveFailure::MissedTarget));
                    continue;
                }
            }
            pending.push((dev.clone(), target));
        }
        if !failures.is_empty() {
            return TransitionOutcome::Failed(failures);
        }

        let now = Instant::now();
        let mut waits: Vec<DeviceWait> = Vec::new();
        for (dev, target) in pending {
            dev.start_move(target);
            let deadline = now + dev.timeout;
            waits.push(DeviceWait {
                dev,
                target,
                deadline,
                best_dist: f64::INFINITY,
                seen_motion: false,
                done: false,
            });
        }

        // Stage barrier: poll until every device completed or one fails.
        let mut ticker = tokio::time::interval(EXEC_POLL);
        loop {
            ticker.tick().await;
            if abort.load(Ordering::SeqCst) {
                stop_incomplete(&waits);
                settle(&waits).await;
                return TransitionOutcome::Aborted;
            }
            let now = Instant::now();
            let mut sweep_failures: Vec<(String, MoveFailure)> = Vec::new();
            for w in waits.iter_mut().filter(|w| !w.done) {
                if let Some(failure) = poll_device(w, now) {
                    sweep_failures.push((w.dev.key.clone(), failure));
                }
            }
            if !sweep_failures.is_empty() {
                stop_incomplete(&waits);
                return TransitionOutcome::Failed(sweep_failures);
            }
            if waits.iter().all(|w| w.done) {
                break;
            }
        }
    }

    apply_update_after(&machine, &to);
    TransitionOutcome::Complete
}

/// One poll of one pending device. Marks completion on the wait, returns
/// a failure reason otherwise.
fn poll_device(w: &mut DeviceWait, now: Instant) -> Option<MoveFailure> {
    let snap = w.dev.snapshot();
    if !snap.connected {
        return Some(MoveFailure::Disconnected);
    }
    if !snap.homed {
        return Some(MoveFailure::NotHomed);
    }
    if !snap.moving && w.dev.at(w.target) {
        w.done = true;
        return None;
    }
    match w.dev.kind {
        DeviceKind::Motor => {
            if snap.moving {
                w.seen_motion = true;
                // Only a new closest approach re-arms the deadline;
                // motion that never resolves stays bounded.
                let dist = match (snap.reading, w.target) {
                    (Reading::Position(rb), TargetValue::Numeric(sp)) => (rb - sp).abs(),
                    _ => f64::INFINITY,
                };
                if dist < w.best_dist {
                    w.best_dist = dist;
                    w.deadline = now + w.dev.timeout;
                }
                (now >= w.deadline).then_some(MoveFailure::Timeout)
            } else if w.seen_motion {
                Some(MoveFailure::MissedTarget)
            } else if now >= w.deadline {
                Some(MoveFailure::Timeout)
            } else {
                None
            }
        }
        // One deadline bounds the whole actuation.
        DeviceKind::Valve => (now >= w.deadline).then_some(MoveFailure::Timeout),
        // at() is always true for placeholders; not reached.
        DeviceKind::Dummy => None,
    }
}

fn stop_incomplete(waits: &[DeviceWait]) {
    for w in waits.iter().filter(|w| !w.done) {
        w.dev.stop();
    }
}

/// Wait until every stopped device reports no motion, bounded by the
/// largest device timeout.
async fn settle(waits: &[DeviceWait]) {
    let bound = waits
        .iter()
        .map(|w| w.dev.timeout)
        .max()
        .unwrap_or(Duration::ZERO);
    let give_up = Instant::now() + bound + Duration::from_secs(1);
    let mut ticker = tokio::time::interval(EXEC_POLL);
    loop {
        ticker.tick().await;
        if waits.iter().all(|w| w.done || !w.dev.moving()) {
            return;
        }
        if Instant::now() >= give_up {
            warn!("giving up waiting for motion to cease after abort");
            return;
        }
    }
}

/// Write the live readback of every `updateAfter` binding back into its
/// target cell (fanning out through the sync map).
fn apply_update_after(machine: &Machine, to: &str) {
    let Some(dest) = machine.states.get(to) else {
        return;
    };
    for (dkey, binding) in dest.bindings.iter().filter(|(_, b)| b.update_after) {
        let Some(dev) = machine.devices.get(dkey) else {
            continue;
        };
        if let Some(rb) = dev.snapshot().reading.position() {
            debug!(device = %dkey, target = %binding.target, readback = rb, "updateAfter");
            machine.store.set(&machine.name, dkey, &binding.target, rb);
        }
    }
}
